//! IndexBucket - one shard of an index's key → actor-set mapping
//!
//! A bucket is reentrant: many callers may apply updates concurrently. Two
//! locks keep it consistent:
//!
//! - `modify_lock` guards the in-memory state; every mutation and snapshot
//!   happens under it, and it is never held across a storage write
//! - `write_lock` serializes durable writes
//!
//! # Group Commit
//!
//! After mutating, a caller takes a write-request id from a monotonically
//! increasing counter and then waits for the write lock. The holder of the
//! write lock reads the latest issued id, snapshots the state, and writes
//! once; that write covers every request issued before the snapshot. Callers
//! that get the write lock afterwards find their id already covered and
//! return without writing:
//!
//! ```text
//! caller A: mutate → id 1 → [write_lock] covered=3, snapshot, save → done
//! caller B: mutate → id 2 → ............................ [write_lock] 2 ≤ 3 → skip
//! caller C: mutate → id 3 → ............................ [write_lock] 3 ≤ 3 → skip
//! ```

use std::{
  collections::{BTreeSet, HashMap},
  fmt,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{IndexError, Result};
use crate::{
  domain::{
    actor::{ActorRef, IndexName},
    image::Image,
    update::{MemberUpdate, OperationType},
  },
  storage::StorageProvider,
};

// ============================================================================
// Identity & Status
// ============================================================================

/// Identity of a bucket: index name plus partition label
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketId {
  pub index: IndexName,
  pub partition: String,
}

impl BucketId {
  pub fn new(index: IndexName, partition: impl Into<String>) -> Self {
    Self {
      index,
      partition: partition.into(),
    }
  }

  pub fn storage_key(&self) -> String {
    format!("bucket/{}/{}", self.index, self.partition)
  }
}

impl fmt::Display for BucketId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]", self.index, self.partition)
  }
}

/// Availability of a bucket
///
/// `UnderConstruction → Available → Disposed`; Disposed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketStatus {
  UnderConstruction,
  Available,
  Disposed,
}

// ============================================================================
// In-memory State
// ============================================================================

#[derive(Debug)]
struct BucketState {
  index_map: HashMap<Image, BTreeSet<ActorRef>>,
  status: BucketStatus,
  /// Deletes observed while the index was being built; a backfill must not
  /// resurrect these entries.
  tombstones: HashMap<Image, BTreeSet<ActorRef>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketSnapshot {
  status: BucketStatus,
  entries: Vec<(Image, Vec<ActorRef>)>,
  #[serde(default)]
  tombstones: Vec<(Image, Vec<ActorRef>)>,
}

fn flatten(map: &HashMap<Image, BTreeSet<ActorRef>>) -> Vec<(Image, Vec<ActorRef>)> {
  let mut entries: Vec<_> = map
    .iter()
    .map(|(key, actors)| (key.clone(), actors.iter().cloned().collect()))
    .collect();
  entries.sort_by(|a, b| a.0.cmp(&b.0));
  entries
}

fn unflatten(entries: Vec<(Image, Vec<ActorRef>)>) -> HashMap<Image, BTreeSet<ActorRef>> {
  entries
    .into_iter()
    .filter(|(_, actors)| !actors.is_empty())
    .map(|(key, actors)| (key, actors.into_iter().collect()))
    .collect()
}

impl BucketState {
  fn new(status: BucketStatus) -> Self {
    Self {
      index_map: HashMap::new(),
      status,
      tombstones: HashMap::new(),
    }
  }

  fn from_snapshot(snapshot: BucketSnapshot) -> Self {
    Self {
      index_map: unflatten(snapshot.entries),
      status: snapshot.status,
      tombstones: unflatten(snapshot.tombstones),
    }
  }

  fn snapshot(&self) -> BucketSnapshot {
    BucketSnapshot {
      status: self.status,
      entries: flatten(&self.index_map),
      tombstones: flatten(&self.tombstones),
    }
  }

  fn contains(&self, key: &Image, actor: &ActorRef) -> bool {
    self.index_map.get(key).is_some_and(|set| set.contains(actor))
  }

  /// Reject a write that would give a unique key a second owner
  fn check_unique(&self, index: &IndexName, key: &Image, actor: &ActorRef) -> Result<()> {
    if let Some(owners) = self.index_map.get(key)
      && let Some(existing) = owners.iter().find(|owner| *owner != actor)
    {
      return Err(IndexError::UniquenessViolation {
        index: index.clone(),
        key: key.clone(),
        existing: existing.clone(),
        actor: actor.clone(),
      });
    }
    Ok(())
  }

  fn insert(&mut self, index: &IndexName, key: &Image, actor: &ActorRef, unique: bool) -> Result<bool> {
    if unique {
      self.check_unique(index, key, actor)?;
    }
    if let Some(tombstoned) = self.tombstones.get_mut(key) {
      tombstoned.remove(actor);
      if tombstoned.is_empty() {
        self.tombstones.remove(key);
      }
    }
    Ok(self.index_map.entry(key.clone()).or_default().insert(actor.clone()))
  }

  fn delete(&mut self, key: &Image, actor: &ActorRef) -> bool {
    let mut changed = false;
    if let Some(owners) = self.index_map.get_mut(key) {
      changed = owners.remove(actor);
      if owners.is_empty() {
        self.index_map.remove(key);
      }
    }
    if self.status != BucketStatus::Available {
      changed |= self.tombstones.entry(key.clone()).or_default().insert(actor.clone());
    }
    changed
  }

  /// Apply one update; returns the change actually made, if any
  ///
  /// An Update whose before-image the actor no longer holds lands as an
  /// Insert of the after-image, and is reported that way.
  fn apply(
    &mut self,
    index: &IndexName,
    actor: &ActorRef,
    update: &MemberUpdate,
    unique: bool,
  ) -> Result<Option<MemberUpdate>> {
    if self.status == BucketStatus::Disposed {
      return Err(IndexError::IndexNotAvailable {
        index: index.clone(),
        status: self.status,
      });
    }

    let changed = |yes: bool, effective: MemberUpdate| yes.then_some(effective);
    match (update.operation(), update.before_image(), update.after_image()) {
      (OperationType::None, _, _) => Ok(None),
      (OperationType::Insert, _, Some(after)) => Ok(changed(self.insert(index, after, actor, unique)?, update.clone())),
      (OperationType::Delete, Some(before), _) => Ok(changed(self.delete(before, actor), update.clone())),
      (OperationType::Update, Some(before), Some(after)) => {
        if !self.contains(before, actor) {
          // Stale before-image: the actor is not where the update thinks it is
          let inserted = self.insert(index, after, actor, unique)?;
          return Ok(changed(inserted, MemberUpdate::insert(after.clone())));
        }
        if unique {
          self.check_unique(index, after, actor)?;
        }
        self.delete(before, actor);
        self.insert(index, after, actor, unique)?;
        Ok(Some(update.clone()))
      }
      // Constructors keep images and tags consistent
      (op, _, _) => {
        warn!(index = %index, ?op, "Ignoring malformed update");
        Ok(None)
      }
    }
  }

  fn ensure_available(&self, index: &IndexName) -> Result<()> {
    if self.status == BucketStatus::Available {
      Ok(())
    } else {
      Err(IndexError::IndexNotAvailable {
        index: index.clone(),
        status: self.status,
      })
    }
  }
}

// ============================================================================
// Batch Results & Stats
// ============================================================================

/// One update of a batch that the bucket rejected
#[derive(Debug)]
pub struct BatchFailure {
  pub actor: ActorRef,
  pub update: MemberUpdate,
  pub error: IndexError,
}

/// Result of applying a batch of updates
#[derive(Debug, Default)]
pub struct BatchOutcome {
  /// Updates that changed the bucket
  pub applied: usize,
  /// Updates that were rejected (uniqueness) and left the bucket untouched
  pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
  pub fn merge(&mut self, other: BatchOutcome) {
    self.applied += other.applied;
    self.failures.extend(other.failures);
  }

  pub fn is_clean(&self) -> bool {
    self.failures.is_empty()
  }
}

/// Observability counters for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
  pub keys: usize,
  pub entries: usize,
  pub status: BucketStatus,
  /// Durable write requests issued by mutating callers
  pub write_requests: u64,
  /// Physical writes performed
  pub writes: u64,
}

// ============================================================================
// IndexBucket
// ============================================================================

/// Hash-map-backed shard of one index
pub struct IndexBucket {
  id: BucketId,
  unique: bool,
  coalesce_writes: bool,
  storage: Arc<dyn StorageProvider>,
  modify_lock: Mutex<BucketState>,
  write_lock: Mutex<()>,
  /// Highest write-request id handed out
  write_requests: AtomicU64,
  /// Highest write-request id known to be durable
  written_through: AtomicU64,
  writes: AtomicU64,
}

impl IndexBucket {
  /// Load a bucket from storage, or create it with `initial_status`
  pub async fn load(
    id: BucketId,
    unique: bool,
    initial_status: BucketStatus,
    storage: Arc<dyn StorageProvider>,
    coalesce_writes: bool,
  ) -> Result<Self> {
    let state = match storage.load_json::<BucketSnapshot>(&id.storage_key()).await? {
      Some(snapshot) => {
        debug!(bucket = %id, entries = snapshot.entries.len(), status = ?snapshot.status, "Loaded index bucket");
        BucketState::from_snapshot(snapshot)
      }
      None => {
        debug!(bucket = %id, status = ?initial_status, "Creating index bucket");
        BucketState::new(initial_status)
      }
    };

    Ok(Self {
      id,
      unique,
      coalesce_writes,
      storage,
      modify_lock: Mutex::new(state),
      write_lock: Mutex::new(()),
      write_requests: AtomicU64::new(0),
      written_through: AtomicU64::new(0),
      writes: AtomicU64::new(0),
    })
  }

  pub fn id(&self) -> &BucketId {
    &self.id
  }

  pub fn is_unique(&self) -> bool {
    self.unique
  }

  /// Apply one update and persist it
  ///
  /// Returns whether the bucket changed. A uniqueness violation leaves the
  /// bucket untouched and is returned to the caller.
  pub async fn apply_update(&self, actor: &ActorRef, update: &MemberUpdate) -> Result<bool> {
    Ok(self.apply_effective(actor, update).await?.is_some())
  }

  /// Like [`IndexBucket::apply_update`], but returns the change the bucket
  /// actually made, which differs from `update` when its before-image was
  /// stale
  pub async fn apply_effective(&self, actor: &ActorRef, update: &MemberUpdate) -> Result<Option<MemberUpdate>> {
    let effective = {
      let mut state = self.modify_lock.lock().await;
      state.apply(&self.id.index, actor, update, self.unique)?
    };
    trace!(
      bucket = %self.id,
      actor = %actor,
      op = ?update.operation(),
      applied = ?effective.as_ref().map(MemberUpdate::operation),
      "Applied index update"
    );

    if effective.is_some() {
      self.persist().await?;
    }
    Ok(effective)
  }

  /// Apply many updates with a single durable write
  ///
  /// Per-update rejections are collected in the outcome; only a storage
  /// failure fails the whole batch.
  pub async fn apply_batch(&self, items: &[(ActorRef, MemberUpdate)]) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    {
      let mut state = self.modify_lock.lock().await;
      for (actor, update) in items {
        match state.apply(&self.id.index, actor, update, self.unique) {
          Ok(Some(_)) => outcome.applied += 1,
          Ok(None) => {}
          Err(error @ IndexError::IndexNotAvailable { .. }) => return Err(error),
          Err(error) => outcome.failures.push(BatchFailure {
            actor: actor.clone(),
            update: update.clone(),
            error,
          }),
        }
      }
    }

    if outcome.applied > 0 {
      self.persist().await?;
    }
    debug!(
      bucket = %self.id,
      batch = items.len(),
      applied = outcome.applied,
      failed = outcome.failures.len(),
      "Applied index batch"
    );
    Ok(outcome)
  }

  /// All actors holding `key`
  pub async fn lookup(&self, key: &Image) -> Result<Vec<ActorRef>> {
    let state = self.modify_lock.lock().await;
    state.ensure_available(&self.id.index)?;
    Ok(
      state
        .index_map
        .get(key)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default(),
    )
  }

  /// The single actor holding `key`
  pub async fn lookup_unique(&self, key: &Image) -> Result<ActorRef> {
    let mut matches = self.lookup(key).await?;
    match matches.len() {
      0 => Err(IndexError::NotFound {
        index: self.id.index.clone(),
        key: key.clone(),
      }),
      1 => Ok(matches.remove(0)),
      count => Err(IndexError::MultipleMatches {
        index: self.id.index.clone(),
        key: key.clone(),
        count,
      }),
    }
  }

  pub async fn status(&self) -> BucketStatus {
    self.modify_lock.lock().await.status
  }

  pub async fn is_available(&self) -> bool {
    self.status().await == BucketStatus::Available
  }

  /// Index-builder entry point: insert an actor found by the backfill scan
  ///
  /// Entries deleted since the build started are skipped.
  pub async fn backfill(&self, key: &Image, actor: &ActorRef) -> Result<bool> {
    let changed = {
      let mut state = self.modify_lock.lock().await;
      if state.status != BucketStatus::UnderConstruction {
        return Ok(false);
      }
      if state.tombstones.get(key).is_some_and(|set| set.contains(actor)) {
        trace!(bucket = %self.id, actor = %actor, "Backfill skipped tombstoned entry");
        return Ok(false);
      }
      state.insert(&self.id.index, key, actor, self.unique)?
    };
    if changed {
      self.persist().await?;
    }
    Ok(changed)
  }

  /// Signal that the backfill finished; lookups are served from now on
  pub async fn mark_available(&self) -> Result<()> {
    {
      let mut state = self.modify_lock.lock().await;
      match state.status {
        BucketStatus::Available => return Ok(()),
        BucketStatus::Disposed => {
          return Err(IndexError::IndexNotAvailable {
            index: self.id.index.clone(),
            status: state.status,
          });
        }
        BucketStatus::UnderConstruction => {
          state.status = BucketStatus::Available;
          state.tombstones.clear();
        }
      }
    }
    debug!(bucket = %self.id, "Index bucket available");
    self.persist().await
  }

  /// Drop all entries; the bucket rejects every later call
  pub async fn dispose(&self) -> Result<()> {
    {
      let mut state = self.modify_lock.lock().await;
      if state.status == BucketStatus::Disposed {
        return Ok(());
      }
      state.status = BucketStatus::Disposed;
      state.index_map.clear();
      state.tombstones.clear();
    }
    debug!(bucket = %self.id, "Index bucket disposed");
    self.persist().await
  }

  pub async fn stats(&self) -> BucketStats {
    let state = self.modify_lock.lock().await;
    BucketStats {
      keys: state.index_map.len(),
      entries: state.index_map.values().map(BTreeSet::len).sum(),
      status: state.status,
      write_requests: self.write_requests.load(Ordering::SeqCst),
      writes: self.writes.load(Ordering::SeqCst),
    }
  }

  /// Durably write the current state, coalescing with concurrent callers
  async fn persist(&self) -> Result<()> {
    let request_id = self.write_requests.fetch_add(1, Ordering::SeqCst) + 1;
    let _writer = self.write_lock.lock().await;

    if self.coalesce_writes && self.written_through.load(Ordering::SeqCst) >= request_id {
      trace!(bucket = %self.id, request_id, "Write already covered by group commit");
      return Ok(());
    }

    // Every id up to `covered` was issued after its mutation, so the
    // snapshot taken below includes all of them.
    let covered = self.write_requests.load(Ordering::SeqCst);
    let snapshot = self.modify_lock.lock().await.snapshot();
    self.storage.save_json(&self.id.storage_key(), &snapshot).await?;

    self.written_through.fetch_max(covered, Ordering::SeqCst);
    self.writes.fetch_add(1, Ordering::SeqCst);
    trace!(bucket = %self.id, request_id, covered, "Index bucket persisted");
    Ok(())
  }
}

impl fmt::Debug for IndexBucket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IndexBucket")
      .field("id", &self.id)
      .field("unique", &self.unique)
      .finish_non_exhaustive()
  }
}
