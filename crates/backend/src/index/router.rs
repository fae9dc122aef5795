//! BucketRouter - decides which bucket owns a key or an actor
//!
//! ```text
//!                    ┌──────────────┐
//!   apply/lookup ──▶ │ BucketRouter │
//!                    └──────┬───────┘
//!         ┌─────────────────┼──────────────────────┐
//!         ▼                 ▼                      ▼
//!      Single          PerKey (hash mod n)     PerHost (one per node)
//!    [bucket all]    [bucket 0] .. [bucket n-1]  [node-1] [node-2] ..
//! ```
//!
//! Per-key routing splits an Update whose images hash to different shards
//! into a Delete on the before shard and an Insert on the after shard, run
//! concurrently. Per-host routing writes to the bucket on the actor's host
//! and answers lookups by scattering to every live node. When an actor
//! reactivates on another node its entries are relocated: inserted on the
//! new host, then deleted from the old one if that node is still alive.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
};

use dashmap::DashMap;
use futures::{
  StreamExt, TryStreamExt,
  future::{self, join_all},
  stream::{self, BoxStream, FuturesUnordered},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
  IndexError, Result,
  bucket::{BatchFailure, BatchOutcome, BucketId, BucketStatus, IndexBucket},
  metadata::{IndexKind, IndexMetaData},
};
use crate::{
  cluster::{Membership, place_among},
  domain::{
    actor::{ActorRef, IndexName, NodeAddress},
    image::Image,
    stable_hash,
    update::{MemberUpdate, OperationType},
  },
  storage::StorageProvider,
};

// ============================================================================
// Hashing Strategy
// ============================================================================

/// Maps an index key to a partition hash
pub trait PartitionHasher: Send + Sync {
  fn hash(&self, key: &Image) -> u64;
}

/// SHA-256 over the canonical image encoding; identical on every node
#[derive(Debug, Clone, Copy, Default)]
pub struct StableHasher;

impl PartitionHasher for StableHasher {
  fn hash(&self, key: &Image) -> u64 {
    stable_hash(&key.canonical_bytes())
  }
}

// ============================================================================
// Router
// ============================================================================

/// One update of a handler batch, tagged with the node the actor ran on
#[derive(Debug, Clone)]
pub struct BatchItem {
  pub actor: ActorRef,
  pub update: MemberUpdate,
  pub origin: NodeAddress,
  /// Set on relocations: the host whose bucket still holds the actor's entry
  pub previous_host: Option<NodeAddress>,
}

impl BatchItem {
  pub fn new(actor: ActorRef, update: MemberUpdate, origin: NodeAddress) -> Self {
    Self {
      actor,
      update,
      origin,
      previous_host: None,
    }
  }
}

/// Settings shared by every bucket of one index
#[derive(Clone)]
pub struct BucketOptions {
  pub unique: bool,
  pub coalesce_writes: bool,
  /// Status of buckets that have no durable state yet
  pub initial_status: BucketStatus,
  pub storage: Arc<dyn StorageProvider>,
}

pub enum BucketRouter {
  Single {
    bucket: Arc<IndexBucket>,
  },
  PerKey {
    buckets: Vec<Arc<IndexBucket>>,
    hasher: Arc<dyn PartitionHasher>,
  },
  PerHost(HostBuckets),
}

impl BucketRouter {
  /// Build the router for an index, loading its buckets from storage
  pub async fn load(
    name: &IndexName,
    metadata: &IndexMetaData,
    options: BucketOptions,
    membership: Arc<dyn Membership>,
  ) -> Result<Self> {
    match metadata.kind {
      IndexKind::SingleBucket => {
        let bucket = open_bucket(BucketId::new(name.clone(), "all"), &options).await?;
        Ok(Self::Single { bucket })
      }
      IndexKind::PerKeyPartition { partitions } => {
        let mut buckets = Vec::with_capacity(partitions);
        for partition in 0..partitions {
          buckets.push(open_bucket(BucketId::new(name.clone(), partition.to_string()), &options).await?);
        }
        Ok(Self::PerKey {
          buckets,
          hasher: Arc::new(StableHasher),
        })
      }
      IndexKind::PerHostPartition => Ok(Self::PerHost(HostBuckets {
        index: name.clone(),
        status: Mutex::new(options.initial_status),
        options,
        membership,
        buckets: DashMap::new(),
      })),
    }
  }

  /// Apply one update for `actor`, which runs on `origin`
  pub async fn apply_update(&self, actor: &ActorRef, update: &MemberUpdate, origin: NodeAddress) -> Result<bool> {
    Ok(self.apply_effective(actor, update, origin).await?.is_some())
  }

  /// Apply one update and return the change the buckets actually made
  ///
  /// Reversing the returned update undoes exactly this call, even when the
  /// before-image was stale and the update landed as an Insert.
  pub async fn apply_effective(
    &self,
    actor: &ActorRef,
    update: &MemberUpdate,
    origin: NodeAddress,
  ) -> Result<Option<MemberUpdate>> {
    match self {
      Self::Single { bucket } => bucket.apply_effective(actor, update).await,
      Self::PerKey { buckets, hasher } => {
        let Some(route) = route_by_key(buckets.len(), hasher.as_ref(), update) else {
          return Ok(None);
        };
        match route {
          KeyRoute::Same(shard) => buckets[shard].apply_effective(actor, update).await,
          KeyRoute::Split { before, after } => {
            apply_split(&buckets[before], &buckets[after], actor, update).await
          }
        }
      }
      Self::PerHost(hosts) => {
        let node = hosts.route(actor, origin)?;
        hosts.bucket_for(node).await?.apply_effective(actor, update).await
      }
    }
  }

  /// Move an actor's entry for `key` from `previous_host` to its current host
  ///
  /// Only per-host indexes keep entries on a host; for other routings this
  /// is a no-op. The entry is inserted on the new host first, then deleted
  /// from the previous one unless that node is gone (its bucket went with
  /// it).
  pub async fn relocate(
    &self,
    actor: &ActorRef,
    key: &Image,
    previous_host: NodeAddress,
    origin: NodeAddress,
  ) -> Result<bool> {
    match self {
      Self::PerHost(hosts) => hosts.relocate(actor, key, previous_host, origin).await,
      _ => Ok(false),
    }
  }

  /// Apply a batch with one call per bucket, all buckets concurrently
  pub async fn apply_batch(&self, items: Vec<BatchItem>) -> Result<BatchOutcome> {
    match self {
      Self::Single { bucket } => {
        let pairs: Vec<_> = items.into_iter().map(|item| (item.actor, item.update)).collect();
        bucket.apply_batch(&pairs).await
      }
      Self::PerKey { buckets, hasher } => apply_batch_by_key(buckets, hasher.as_ref(), items).await,
      Self::PerHost(hosts) => {
        // Relocations touch two hosts; they split the batch into runs so
        // every actor's updates still land in queue order
        let mut outcome = BatchOutcome::default();
        let mut run = Vec::new();
        for item in items {
          let Some(previous_host) = item.previous_host else {
            run.push(item);
            continue;
          };
          outcome.merge(hosts.apply_run(std::mem::take(&mut run)).await?);
          if let Some(key) = item.update.after_image()
            && hosts.relocate(&item.actor, key, previous_host, item.origin).await?
          {
            outcome.applied += 1;
          }
        }
        outcome.merge(hosts.apply_run(run).await?);
        Ok(outcome)
      }
    }
  }

  /// Insert an entry found by an index-builder scan
  pub async fn backfill(&self, key: &Image, actor: &ActorRef, origin: NodeAddress) -> Result<bool> {
    match self {
      Self::Single { bucket } => bucket.backfill(key, actor).await,
      Self::PerKey { buckets, hasher } => {
        let shard = shard_of(buckets.len(), hasher.as_ref(), key);
        buckets[shard].backfill(key, actor).await
      }
      Self::PerHost(hosts) => {
        let node = hosts.route(actor, origin)?;
        hosts.bucket_for(node).await?.backfill(key, actor).await
      }
    }
  }

  /// Actors holding `key`, delivered as buckets answer
  ///
  /// Per-host lookups yield results in completion order; duplicates are
  /// filtered but nothing is sorted.
  pub fn lookup_stream<'a>(&'a self, key: &'a Image) -> BoxStream<'a, Result<ActorRef>> {
    let answers: BoxStream<'a, Result<Vec<ActorRef>>> = match self {
      Self::Single { bucket } => stream::once(bucket.lookup(key)).boxed(),
      Self::PerKey { buckets, hasher } => {
        let shard = shard_of(buckets.len(), hasher.as_ref(), key);
        stream::once(buckets[shard].lookup(key)).boxed()
      }
      Self::PerHost(hosts) => {
        let pending: FuturesUnordered<_> = hosts
          .membership
          .live_nodes()
          .into_iter()
          .map(move |node| async move { hosts.bucket_for(node).await?.lookup(key).await })
          .collect();
        pending.boxed()
      }
    };

    let mut seen = HashSet::new();
    answers
      .flat_map(|answer| match answer {
        Ok(actors) => stream::iter(actors.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(future::ready(Err(e))).boxed(),
      })
      .filter(move |item| {
        let keep = match item {
          Ok(actor) => seen.insert(actor.clone()),
          Err(_) => true,
        };
        future::ready(keep)
      })
      .boxed()
  }

  pub async fn lookup(&self, key: &Image) -> Result<Vec<ActorRef>> {
    self.lookup_stream(key).try_collect().await
  }

  /// Actors holding `key` in the bucket kept on `node`
  ///
  /// Only per-host indexes keep buckets per node; other routings answer
  /// the full lookup.
  pub async fn lookup_on_host(&self, node: NodeAddress, key: &Image) -> Result<Vec<ActorRef>> {
    match self {
      Self::PerHost(hosts) => hosts.bucket_for(node).await?.lookup(key).await,
      _ => self.lookup(key).await,
    }
  }

  pub async fn lookup_unique(&self, key: &Image) -> Result<ActorRef> {
    match self {
      Self::Single { bucket } => bucket.lookup_unique(key).await,
      Self::PerKey { buckets, hasher } => {
        let shard = shard_of(buckets.len(), hasher.as_ref(), key);
        buckets[shard].lookup_unique(key).await
      }
      Self::PerHost(hosts) => {
        let mut matches = self.lookup(key).await?;
        match matches.len() {
          0 => Err(IndexError::NotFound {
            index: hosts.index.clone(),
            key: key.clone(),
          }),
          1 => Ok(matches.remove(0)),
          count => Err(IndexError::MultipleMatches {
            index: hosts.index.clone(),
            key: key.clone(),
            count,
          }),
        }
      }
    }
  }

  pub async fn is_available(&self) -> bool {
    match self {
      Self::Single { bucket } => bucket.is_available().await,
      Self::PerKey { buckets, .. } => {
        for bucket in buckets {
          if !bucket.is_available().await {
            return false;
          }
        }
        true
      }
      Self::PerHost(hosts) => *hosts.status.lock().await == BucketStatus::Available,
    }
  }

  pub async fn mark_available(&self) -> Result<()> {
    match self {
      Self::PerHost(hosts) => hosts.transition(BucketStatus::Available).await,
      _ => {
        for bucket in self.buckets() {
          bucket.mark_available().await?;
        }
        Ok(())
      }
    }
  }

  pub async fn dispose(&self) -> Result<()> {
    match self {
      Self::PerHost(hosts) => hosts.transition(BucketStatus::Disposed).await,
      _ => {
        for bucket in self.buckets() {
          bucket.dispose().await?;
        }
        Ok(())
      }
    }
  }

  /// Buckets currently loaded for this index
  pub fn buckets(&self) -> Vec<Arc<IndexBucket>> {
    match self {
      Self::Single { bucket } => vec![Arc::clone(bucket)],
      Self::PerKey { buckets, .. } => buckets.clone(),
      Self::PerHost(hosts) => {
        let mut loaded: Vec<_> = hosts
          .buckets
          .iter()
          .map(|entry| (*entry.key(), Arc::clone(entry.value())))
          .collect();
        loaded.sort_by_key(|(node, _)| *node);
        loaded.into_iter().map(|(_, bucket)| bucket).collect()
      }
    }
  }
}

impl fmt::Debug for BucketRouter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Single { bucket } => f.debug_struct("Single").field("bucket", bucket.id()).finish(),
      Self::PerKey { buckets, .. } => f.debug_struct("PerKey").field("partitions", &buckets.len()).finish(),
      Self::PerHost(hosts) => f
        .debug_struct("PerHost")
        .field("index", &hosts.index)
        .field("loaded", &hosts.buckets.len())
        .finish(),
    }
  }
}

async fn open_bucket(id: BucketId, options: &BucketOptions) -> Result<Arc<IndexBucket>> {
  let bucket = IndexBucket::load(
    id,
    options.unique,
    options.initial_status,
    Arc::clone(&options.storage),
    options.coalesce_writes,
  )
  .await?;
  Ok(Arc::new(bucket))
}

// ============================================================================
// Per-key routing
// ============================================================================

enum KeyRoute {
  Same(usize),
  Split { before: usize, after: usize },
}

fn shard_of(partitions: usize, hasher: &dyn PartitionHasher, key: &Image) -> usize {
  (hasher.hash(key) % partitions as u64) as usize
}

fn route_by_key(partitions: usize, hasher: &dyn PartitionHasher, update: &MemberUpdate) -> Option<KeyRoute> {
  match (update.operation(), update.before_image(), update.after_image()) {
    (OperationType::None, _, _) => None,
    (OperationType::Update, Some(before), Some(after)) => {
      let before = shard_of(partitions, hasher, before);
      let after = shard_of(partitions, hasher, after);
      if before == after {
        Some(KeyRoute::Same(after))
      } else {
        Some(KeyRoute::Split { before, after })
      }
    }
    (_, _, Some(key)) | (_, Some(key), None) => Some(KeyRoute::Same(shard_of(partitions, hasher, key))),
    _ => None,
  }
}

/// Delete from the before shard and insert into the after shard concurrently
///
/// If one half fails the other half is undone, so the actor is never left
/// in both shards or in neither. Returns the halves that changed a bucket,
/// recombined.
async fn apply_split(
  before_bucket: &IndexBucket,
  after_bucket: &IndexBucket,
  actor: &ActorRef,
  update: &MemberUpdate,
) -> Result<Option<MemberUpdate>> {
  let (Some(delete), Some(insert)) = update.split() else {
    return Ok(None);
  };

  let (deleted, inserted) = tokio::join!(
    before_bucket.apply_effective(actor, &delete),
    after_bucket.apply_effective(actor, &insert)
  );

  match (deleted, inserted) {
    (Ok(Some(_)), Ok(Some(_))) => Ok(Some(update.clone())),
    (Ok(d), Ok(i)) => Ok(d.or(i)),
    (Ok(Some(deleted)), Err(e)) => {
      debug!(actor = %actor, error = %e, "Insert half of split update failed, restoring before-image");
      if let Err(undo) = before_bucket.apply_update(actor, &deleted.reverse_tentative()).await {
        warn!(actor = %actor, error = %undo, "Failed to restore before-image");
      }
      Err(e)
    }
    (Err(e), Ok(Some(inserted))) => {
      if let Err(undo) = after_bucket.apply_update(actor, &inserted.reverse_tentative()).await {
        warn!(actor = %actor, error = %undo, "Failed to undo insert half of split update");
      }
      Err(e)
    }
    (Ok(None), Err(e)) | (Err(e), Ok(None)) | (Err(e), Err(_)) => Err(e),
  }
}

async fn apply_batch_by_key(
  buckets: &[Arc<IndexBucket>],
  hasher: &dyn PartitionHasher,
  items: Vec<BatchItem>,
) -> Result<BatchOutcome> {
  let mut by_shard: Vec<Vec<(ActorRef, MemberUpdate)>> = vec![Vec::new(); buckets.len()];
  // Insert halves of split updates: (actor, after key) → (before shard, original update)
  let mut split_origins: HashMap<(ActorRef, Image), (usize, MemberUpdate)> = HashMap::new();

  for item in items {
    match route_by_key(buckets.len(), hasher, &item.update) {
      None => {}
      Some(KeyRoute::Same(shard)) => by_shard[shard].push((item.actor, item.update)),
      Some(KeyRoute::Split { before, after }) => {
        if let (Some(delete), Some(insert)) = item.update.split() {
          if let Some(key) = insert.after_image() {
            split_origins.insert((item.actor.clone(), key.clone()), (before, item.update.clone()));
          }
          by_shard[before].push((item.actor.clone(), delete));
          by_shard[after].push((item.actor, insert));
        }
      }
    }
  }

  let results = join_all(
    buckets
      .iter()
      .zip(by_shard.iter())
      .filter(|(_, pairs)| !pairs.is_empty())
      .map(|(bucket, pairs)| bucket.apply_batch(pairs)),
  )
  .await;

  let mut outcome = BatchOutcome::default();
  for result in results {
    outcome.merge(result?);
  }

  // A rejected insert half leaves its delete half applied; put the actor back
  let mut failures = Vec::with_capacity(outcome.failures.len());
  for failure in outcome.failures {
    let origin = failure
      .update
      .after_image()
      .filter(|_| failure.update.operation() == OperationType::Insert)
      .and_then(|key| split_origins.get(&(failure.actor.clone(), key.clone())));

    match origin {
      Some((shard, original)) => {
        if let Some(delete) = original.split().0 {
          let restore = delete.reverse_tentative();
          if let Err(e) = buckets[*shard].apply_update(&failure.actor, &restore).await {
            warn!(actor = %failure.actor, error = %e, "Failed to restore before-image after rejected insert");
          }
        }
        failures.push(BatchFailure {
          actor: failure.actor,
          update: original.clone(),
          error: failure.error,
        });
      }
      None => failures.push(failure),
    }
  }
  outcome.failures = failures;
  Ok(outcome)
}

// ============================================================================
// Per-host routing
// ============================================================================

/// One bucket per cluster node, loaded on first use
pub struct HostBuckets {
  index: IndexName,
  options: BucketOptions,
  membership: Arc<dyn Membership>,
  buckets: DashMap<NodeAddress, Arc<IndexBucket>>,
  /// Index-wide status; also serializes bucket creation
  status: Mutex<BucketStatus>,
}

impl HostBuckets {
  /// Host bucket for an actor: its recorded origin, or its new placement
  /// when the origin has died
  fn route(&self, actor: &ActorRef, origin: NodeAddress) -> Result<NodeAddress> {
    if self.membership.is_alive(origin) {
      return Ok(origin);
    }
    let node = place_among(&self.membership.live_nodes(), actor.placement_hash()).ok_or_else(|| {
      IndexError::HostUnavailable {
        index: self.index.clone(),
        node: origin,
      }
    })?;
    debug!(index = %self.index, actor = %actor, from = %origin, to = %node, "Origin node dead, rerouting update");
    Ok(node)
  }

  /// Apply a run of plain updates, one batch per host, hosts concurrently
  async fn apply_run(&self, items: Vec<BatchItem>) -> Result<BatchOutcome> {
    let mut by_node: HashMap<NodeAddress, Vec<(ActorRef, MemberUpdate)>> = HashMap::new();
    for item in items {
      let node = self.route(&item.actor, item.origin)?;
      by_node.entry(node).or_default().push((item.actor, item.update));
    }

    let results = join_all(by_node.into_iter().map(|(node, pairs)| async move {
      let bucket = self.bucket_for(node).await?;
      bucket.apply_batch(&pairs).await
    }))
    .await;

    let mut outcome = BatchOutcome::default();
    for result in results {
      outcome.merge(result?);
    }
    Ok(outcome)
  }

  async fn relocate(
    &self,
    actor: &ActorRef,
    key: &Image,
    previous_host: NodeAddress,
    origin: NodeAddress,
  ) -> Result<bool> {
    let node = self.route(actor, origin)?;
    let inserted = self
      .bucket_for(node)
      .await?
      .apply_update(actor, &MemberUpdate::insert(key.clone()))
      .await?;
    if previous_host == node || !self.membership.is_alive(previous_host) {
      return Ok(inserted);
    }
    let deleted = self
      .bucket_for(previous_host)
      .await?
      .apply_update(actor, &MemberUpdate::delete(key.clone()))
      .await?;
    debug!(index = %self.index, actor = %actor, from = %previous_host, to = %node, "Relocated index entry");
    Ok(inserted || deleted)
  }

  async fn bucket_for(&self, node: NodeAddress) -> Result<Arc<IndexBucket>> {
    if let Some(bucket) = self.buckets.get(&node) {
      return Ok(Arc::clone(bucket.value()));
    }

    let status = self.status.lock().await;
    if let Some(bucket) = self.buckets.get(&node) {
      return Ok(Arc::clone(bucket.value()));
    }

    let options = BucketOptions {
      initial_status: *status,
      ..self.options.clone()
    };
    let bucket = open_bucket(BucketId::new(self.index.clone(), node.to_string()), &options).await?;
    self.buckets.insert(node, Arc::clone(&bucket));
    Ok(bucket)
  }

  async fn transition(&self, target: BucketStatus) -> Result<()> {
    let mut status = self.status.lock().await;
    if *status == BucketStatus::Disposed && target != BucketStatus::Disposed {
      return Err(IndexError::IndexNotAvailable {
        index: self.index.clone(),
        status: *status,
      });
    }
    *status = target;
    let loaded: Vec<_> = self.buckets.iter().map(|entry| Arc::clone(entry.value())).collect();
    for bucket in loaded {
      match target {
        BucketStatus::Available => bucket.mark_available().await?,
        BucketStatus::Disposed => bucket.dispose().await?,
        BucketStatus::UnderConstruction => {}
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::{cluster::Cluster, storage::MemoryStorage};

  fn actor(id: &str) -> ActorRef {
    ActorRef::new("Player", id)
  }

  fn img(s: &str) -> Image {
    Image::from(s)
  }

  fn options(unique: bool) -> BucketOptions {
    BucketOptions {
      unique,
      coalesce_writes: true,
      initial_status: BucketStatus::Available,
      storage: Arc::new(MemoryStorage::new()),
    }
  }

  fn metadata(kind: IndexKind, unique: bool) -> IndexMetaData {
    IndexMetaData {
      kind,
      unique,
      eager: false,
      storage: None,
    }
  }

  async fn router(kind: IndexKind, unique: bool, cluster: Arc<Cluster>) -> BucketRouter {
    BucketRouter::load(&IndexName::new("Idx"), &metadata(kind, unique), options(unique), cluster)
      .await
      .unwrap()
  }

  fn cluster(nodes: usize) -> (Arc<Cluster>, Vec<NodeAddress>) {
    let cluster = Arc::new(Cluster::new(CancellationToken::new()));
    let addrs = (0..nodes).map(|_| cluster.add_node()).collect();
    (cluster, addrs)
  }

  /// Two keys that land in different shards of `partitions`
  fn keys_in_different_shards(partitions: usize) -> (Image, Image) {
    let first = img("key-0");
    let first_shard = shard_of(partitions, &StableHasher, &first);
    let second = (1..100)
      .map(|i| img(&format!("key-{i}")))
      .find(|k| shard_of(partitions, &StableHasher, k) != first_shard)
      .unwrap();
    (first, second)
  }

  #[test]
  fn test_stable_hasher_is_deterministic() {
    assert_eq!(StableHasher.hash(&img("Seattle")), StableHasher.hash(&img("Seattle")));
    assert_ne!(StableHasher.hash(&img("Seattle")), StableHasher.hash(&img("Portland")));
  }

  #[tokio::test]
  async fn test_per_key_split_update_moves_across_shards() {
    let (cluster, nodes) = cluster(1);
    let router = router(IndexKind::PerKeyPartition { partitions: 4 }, false, cluster).await;
    let (a, b) = keys_in_different_shards(4);

    router.apply_update(&actor("p1"), &MemberUpdate::insert(a.clone()), nodes[0]).await.unwrap();
    router
      .apply_update(&actor("p1"), &MemberUpdate::new(Some(a.clone()), Some(b.clone())), nodes[0])
      .await
      .unwrap();

    assert!(router.lookup(&a).await.unwrap().is_empty());
    assert_eq!(router.lookup(&b).await.unwrap(), vec![actor("p1")]);
  }

  #[tokio::test]
  async fn test_per_key_split_rejected_insert_restores_before() {
    let (cluster, nodes) = cluster(1);
    let router = router(IndexKind::PerKeyPartition { partitions: 4 }, true, cluster).await;
    let (a, b) = keys_in_different_shards(4);

    router.apply_update(&actor("p1"), &MemberUpdate::insert(a.clone()), nodes[0]).await.unwrap();
    router.apply_update(&actor("p2"), &MemberUpdate::insert(b.clone()), nodes[0]).await.unwrap();

    let err = router
      .apply_update(&actor("p1"), &MemberUpdate::new(Some(a.clone()), Some(b.clone())), nodes[0])
      .await
      .unwrap_err();
    assert!(err.is_uniqueness_violation());
    assert_eq!(router.lookup_unique(&a).await.unwrap(), actor("p1"));
    assert_eq!(router.lookup_unique(&b).await.unwrap(), actor("p2"));
  }

  #[tokio::test]
  async fn test_per_key_batch_reports_original_update() {
    let (cluster, nodes) = cluster(1);
    let router = router(IndexKind::PerKeyPartition { partitions: 4 }, true, cluster).await;
    let (a, b) = keys_in_different_shards(4);
    router.apply_update(&actor("p1"), &MemberUpdate::insert(a.clone()), nodes[0]).await.unwrap();
    router.apply_update(&actor("p2"), &MemberUpdate::insert(b.clone()), nodes[0]).await.unwrap();

    let moved = MemberUpdate::new(Some(a.clone()), Some(b.clone()));
    let outcome = router
      .apply_batch(vec![BatchItem::new(actor("p1"), moved.clone(), nodes[0])])
      .await
      .unwrap();

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].update, moved);
    assert_eq!(router.lookup_unique(&a).await.unwrap(), actor("p1"));
  }

  #[tokio::test]
  async fn test_per_host_scatter_gather() {
    let (cluster, nodes) = cluster(3);
    let router = router(IndexKind::PerHostPartition, false, cluster).await;

    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("Seattle")), nodes[0]).await.unwrap();
    router.apply_update(&actor("p2"), &MemberUpdate::insert(img("Seattle")), nodes[1]).await.unwrap();
    router.apply_update(&actor("p3"), &MemberUpdate::insert(img("Portland")), nodes[2]).await.unwrap();

    let mut found = router.lookup(&img("Seattle")).await.unwrap();
    found.sort();
    assert_eq!(found, vec![actor("p1"), actor("p2")]);
    assert_eq!(router.buckets().len(), 3);
  }

  #[tokio::test]
  async fn test_per_host_dead_origin_reroutes() {
    let (cluster, nodes) = cluster(2);
    let router = router(IndexKind::PerHostPartition, false, Arc::clone(&cluster)).await;
    cluster.kill_node(nodes[0]);

    let outcome = router
      .apply_batch(vec![BatchItem::new(actor("p1"), MemberUpdate::insert(img("Seattle")), nodes[0])])
      .await
      .unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(router.lookup(&img("Seattle")).await.unwrap(), vec![actor("p1")]);
  }

  #[tokio::test]
  async fn test_per_host_lookup_ignores_dead_nodes() {
    let (cluster, nodes) = cluster(2);
    let router = router(IndexKind::PerHostPartition, false, Arc::clone(&cluster)).await;
    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("Seattle")), nodes[0]).await.unwrap();
    router.apply_update(&actor("p2"), &MemberUpdate::insert(img("Seattle")), nodes[1]).await.unwrap();

    cluster.kill_node(nodes[0]);
    assert_eq!(router.lookup(&img("Seattle")).await.unwrap(), vec![actor("p2")]);
  }

  #[tokio::test]
  async fn test_per_host_status_applies_to_new_buckets() {
    let (cluster, nodes) = cluster(2);
    let mut opts = options(false);
    opts.initial_status = BucketStatus::UnderConstruction;
    let router = BucketRouter::load(
      &IndexName::new("Idx"),
      &metadata(IndexKind::PerHostPartition, false),
      opts,
      cluster,
    )
    .await
    .unwrap();

    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("a")), nodes[0]).await.unwrap();
    assert!(!router.is_available().await);
    assert!(router.lookup(&img("a")).await.is_err());

    router.mark_available().await.unwrap();
    // A bucket created after the transition starts out available
    router.apply_update(&actor("p2"), &MemberUpdate::insert(img("a")), nodes[1]).await.unwrap();
    assert_eq!(router.lookup(&img("a")).await.unwrap().len(), 2);

    router.dispose().await.unwrap();
    assert!(router.mark_available().await.is_err());
  }

  #[tokio::test]
  async fn test_per_key_split_reports_effective_change() {
    let (cluster, nodes) = cluster(1);
    let router = router(IndexKind::PerKeyPartition { partitions: 4 }, false, cluster).await;
    let (a, b) = keys_in_different_shards(4);

    // p1 never held `a`, so only the insert half lands
    let effective = router
      .apply_effective(&actor("p1"), &MemberUpdate::new(Some(a.clone()), Some(b.clone())), nodes[0])
      .await
      .unwrap();
    assert_eq!(effective, Some(MemberUpdate::insert(b.clone())));

    let effective = router
      .apply_effective(&actor("p1"), &MemberUpdate::new(Some(b.clone()), Some(a.clone())), nodes[0])
      .await
      .unwrap();
    assert_eq!(effective, Some(MemberUpdate::new(Some(b), Some(a))));
  }

  #[tokio::test]
  async fn test_relocate_moves_entry_between_hosts() {
    let (cluster, nodes) = cluster(2);
    let router = router(IndexKind::PerHostPartition, false, Arc::clone(&cluster)).await;
    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("Seattle")), nodes[0]).await.unwrap();

    assert!(router.relocate(&actor("p1"), &img("Seattle"), nodes[0], nodes[1]).await.unwrap());

    let buckets = router.buckets();
    assert_eq!(buckets.len(), 2);
    assert!(buckets[0].lookup(&img("Seattle")).await.unwrap().is_empty());
    assert_eq!(buckets[1].lookup(&img("Seattle")).await.unwrap(), vec![actor("p1")]);
  }

  #[tokio::test]
  async fn test_relocate_from_dead_host_only_inserts() {
    let (cluster, nodes) = cluster(2);
    let router = router(IndexKind::PerHostPartition, false, Arc::clone(&cluster)).await;
    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("Seattle")), nodes[0]).await.unwrap();
    cluster.kill_node(nodes[0]);

    assert!(router.relocate(&actor("p1"), &img("Seattle"), nodes[0], nodes[1]).await.unwrap());
    assert_eq!(router.lookup(&img("Seattle")).await.unwrap(), vec![actor("p1")]);
  }

  #[tokio::test]
  async fn test_batch_relocation_keeps_actor_order() {
    let (cluster, nodes) = cluster(2);
    let router = router(IndexKind::PerHostPartition, false, Arc::clone(&cluster)).await;
    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("Seattle")), nodes[0]).await.unwrap();

    // Queued on the old host, then relocated, then moved again on the new one
    let relocation = BatchItem {
      previous_host: Some(nodes[0]),
      ..BatchItem::new(actor("p1"), MemberUpdate::insert(img("Portland")), nodes[1])
    };
    let outcome = router
      .apply_batch(vec![
        BatchItem::new(actor("p1"), MemberUpdate::new(Some(img("Seattle")), Some(img("Portland"))), nodes[0]),
        relocation,
        BatchItem::new(actor("p1"), MemberUpdate::new(Some(img("Portland")), Some(img("Denver"))), nodes[1]),
      ])
      .await
      .unwrap();

    assert!(outcome.failures.is_empty());
    assert!(router.lookup(&img("Seattle")).await.unwrap().is_empty());
    assert!(router.lookup(&img("Portland")).await.unwrap().is_empty());
    assert_eq!(router.lookup(&img("Denver")).await.unwrap(), vec![actor("p1")]);
  }

  #[tokio::test]
  async fn test_lookup_stream_deduplicates() {
    let (cluster, nodes) = cluster(2);
    let router = router(IndexKind::PerHostPartition, false, cluster).await;
    // Same actor recorded on both hosts, e.g. across a migration
    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("a")), nodes[0]).await.unwrap();
    router.apply_update(&actor("p1"), &MemberUpdate::insert(img("a")), nodes[1]).await.unwrap();

    let found: Vec<_> = router.lookup_stream(&img("a")).try_collect().await.unwrap();
    assert_eq!(found, vec![actor("p1")]);
  }
}
