//! IndexableActor - index maintenance behavior composed into every grain
//!
//! Holds the per-actor before-image cache and decides, per index, how an
//! update reaches the buckets:
//!
//! ```text
//!  mutation ──▶ diff before/after per index ──▶ drop None
//!                                                  │
//!       ┌──────────────────────┬───────────────────┴──────────┐
//!       ▼                      ▼                              ▼
//!    Eager                 Tentative                        Lazy
//!  (not fault tolerant)  (fault tolerant + unique)        (everything else)
//!  apply now             apply now AND queue              queue
//!       └──────────┬───────────┘                              │
//!                  ▼                                          ▼
//!          EagerApplier (compensates               LazyQueueApplier
//!           on failure, aborts mutation)           (one WorkflowRecord)
//! ```
//!
//! Before-images only move forward once every synchronous write and the
//! enqueue succeeded. Fault-tolerant actors also track the ids of workflows
//! they believe are still pending, and reconcile that set against their
//! queue on activation before serving any request.
//!
//! Per-host index entries live on the node the actor ran on. The actor
//! remembers that node; when it activates somewhere else it relocates its
//! entries through the same update paths before serving.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{
  domain::{
    actor::{ActorRef, IndexName, NodeAddress},
    image::{Image, PropertyBag},
    update::MemberUpdate,
  },
  index::{BucketStatus, IndexError, IndexKind, IndexMetaData, RegisteredIndex, RegistryError, TypeCatalog},
  runtime::Runtime,
  storage::StorageError,
  workflow::{QueueError, WorkflowId, WorkflowQueueHandle, WorkflowQueueId, WorkflowRecord},
};

#[derive(Debug, thiserror::Error)]
pub enum IndexingError {
  #[error("Index error: {0}")]
  Index(#[from] IndexError),
  #[error("Registry error: {0}")]
  Registry(#[from] RegistryError),
  #[error("Queue error: {0}")]
  Queue(#[from] QueueError),
  #[error("Workflow queue unreachable during recovery: {0}")]
  QueueUnreachable(String),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
}

impl IndexingError {
  pub fn is_uniqueness_violation(&self) -> bool {
    matches!(self, IndexingError::Index(e) if e.is_uniqueness_violation())
  }

  fn is_stale_index_list(&self) -> bool {
    matches!(self, IndexingError::Registry(RegistryError::StaleIndexList { .. }))
  }
}

type Result<T> = std::result::Result<T, IndexingError>;

/// How one index's update is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePath {
  /// Applied before the mutation is acknowledged
  Eager,
  /// Applied before the mutation is acknowledged and also queued, so the
  /// handler can undo it if the workflow is later found inactive
  Tentative,
  /// Queued and applied by the workflow queue handler
  Lazy,
}

impl UpdatePath {
  pub fn select(fault_tolerant: bool, metadata: &IndexMetaData) -> Self {
    match (fault_tolerant, metadata.eager, metadata.unique) {
      (false, true, _) => UpdatePath::Eager,
      (true, _, true) => UpdatePath::Tentative,
      _ => UpdatePath::Lazy,
    }
  }
}

/// Result of a successful mutation, applied with [`IndexableActor::commit`]
#[derive(Debug)]
pub struct PendingCommit {
  pub workflow_id: Option<WorkflowId>,
  before_images: BTreeMap<IndexName, Image>,
  sequence: u64,
  applied: Vec<SyncUpdate>,
}

/// What [`IndexableActor::commit`] replaced, for [`IndexableActor::rollback`]
#[derive(Debug)]
pub struct CommitUndo {
  before_images: BTreeMap<IndexName, Image>,
  active_workflows: Option<BTreeSet<WorkflowId>>,
  sequence: u64,
  applied: Vec<SyncUpdate>,
}

// ============================================================================
// Strategies
// ============================================================================

/// Applies updates synchronously; undoes the ones that landed if any fails
struct EagerApplier {
  actor: ActorRef,
  node: NodeAddress,
}

type SyncUpdate = (Arc<RegisteredIndex>, MemberUpdate);

impl EagerApplier {
  /// Returns the changes the buckets actually made
  async fn apply(&self, updates: &[SyncUpdate]) -> Result<Vec<SyncUpdate>> {
    if updates.is_empty() {
      return Ok(Vec::new());
    }

    let results = join_all(
      updates
        .iter()
        .map(|(index, update)| index.router.apply_effective(&self.actor, update, self.node)),
    )
    .await;

    let mut applied = Vec::new();
    let mut failure = None;
    for ((index, _), result) in updates.iter().zip(results) {
      match result {
        Ok(Some(effective)) => applied.push((Arc::clone(index), effective)),
        Ok(None) => {}
        Err(e) => {
          debug!(actor = %self.actor, index = %index.name, error = %e, "Synchronous index update failed");
          failure.get_or_insert(e);
        }
      }
    }

    match failure {
      None => Ok(applied),
      Some(e) => {
        self.compensate(&applied).await;
        Err(e.into())
      }
    }
  }

  /// Undo changes returned by [`EagerApplier::apply`]
  async fn compensate(&self, applied: &[SyncUpdate]) {
    for (index, update) in applied {
      let reverse = update.reverse_tentative();
      if let Err(e) = index.router.apply_update(&self.actor, &reverse, self.node).await {
        warn!(actor = %self.actor, index = %index.name, error = %e, "Failed to compensate index update");
      }
    }
  }
}

/// Enqueues a workflow record, re-resolving the queue once if its host died
struct LazyQueueApplier<'a> {
  runtime: &'a Arc<Runtime>,
  cached: &'a mut Option<WorkflowQueueHandle>,
  actor: &'a ActorRef,
}

impl LazyQueueApplier<'_> {
  async fn queue(&mut self) -> Result<WorkflowQueueHandle> {
    if let Some(queue) = self.cached.as_ref()
      && self.runtime.is_queue_live(queue)
    {
      return Ok(queue.clone());
    }
    let id = self.runtime.queues().queue_id_for(self.actor);
    let queue = self.runtime.queues().resolve(self.runtime, &id).await?;
    *self.cached = Some(queue.clone());
    Ok(queue)
  }

  async fn enqueue(&mut self, record: WorkflowRecord) -> Result<()> {
    let queue = self.queue().await?;
    match queue.add_to_queue(record.clone()).await {
      Err(QueueError::Unreachable(id)) => {
        debug!(actor = %self.actor, queue = %id, "Workflow queue unreachable, resolving again");
        *self.cached = None;
        let queue = self.queue().await?;
        Ok(queue.add_to_queue(record).await?)
      }
      other => Ok(other?),
    }
  }
}

// ============================================================================
// IndexableActor
// ============================================================================

pub struct IndexableActor {
  reference: ActorRef,
  node: NodeAddress,
  runtime: Arc<Runtime>,
  catalog: Arc<TypeCatalog>,
  before_images: BTreeMap<IndexName, Image>,
  /// `Some` only for fault-tolerant actor types
  active_workflows: Option<BTreeSet<WorkflowId>>,
  sequence: u64,
  /// Node whose per-host buckets hold this actor's entries
  index_host: Option<NodeAddress>,
  queue: Option<WorkflowQueueHandle>,
}

impl IndexableActor {
  pub fn new(
    reference: ActorRef,
    node: NodeAddress,
    runtime: Arc<Runtime>,
    catalog: Arc<TypeCatalog>,
    before_images: BTreeMap<IndexName, Image>,
    active_workflows: BTreeSet<WorkflowId>,
    sequence: u64,
    index_host: Option<NodeAddress>,
  ) -> Self {
    let active_workflows = catalog.fault_tolerant.then_some(active_workflows);
    Self {
      reference,
      node,
      runtime,
      catalog,
      before_images,
      active_workflows,
      sequence,
      index_host,
      queue: None,
    }
  }

  pub fn before_images(&self) -> &BTreeMap<IndexName, Image> {
    &self.before_images
  }

  pub fn active_workflows(&self) -> Option<&BTreeSet<WorkflowId>> {
    self.active_workflows.as_ref()
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn index_host(&self) -> Option<NodeAddress> {
    self.index_host
  }

  /// Seed missing before-images from current properties and drop the ones
  /// of indexes no longer declared; returns whether anything changed
  pub fn seed_before_images(&mut self, properties: &PropertyBag) -> bool {
    let mut changed = false;
    for (name, index) in &self.catalog.indexes {
      if self.before_images.contains_key(name) {
        continue;
      }
      if let Some(image) = index.extract_image(properties) {
        self.before_images.insert(name.clone(), image);
        changed = true;
      }
    }
    let declared = &self.catalog.indexes;
    let before = self.before_images.len();
    self.before_images.retain(|name, _| declared.contains_key(name));
    changed || before != self.before_images.len()
  }

  /// Activation hook: run recovery when workflows may still be pending
  ///
  /// Returns whether the active workflow set changed and must be persisted
  /// before the activation completes.
  pub async fn on_activate(&mut self) -> Result<bool> {
    let Some(active) = self.active_workflows.clone() else {
      return Ok(false);
    };
    if active.is_empty() {
      return Ok(false);
    }

    let queue_id = self.runtime.queues().queue_id_for(&self.reference);
    let remaining = match self.runtime.queues().cached(&queue_id) {
      Some(cached) => match cached.get_remaining_workflows_in(&self.reference, active.clone()).await {
        Ok(remaining) => remaining,
        Err(e) => {
          debug!(actor = %self.reference, queue = %queue_id, error = %e, "Cached workflow queue unreachable");
          self.remaining_from_reincarnation(&queue_id, &active).await?
        }
      },
      None => self.remaining_from_reincarnation(&queue_id, &active).await?,
    };

    if !remaining.is_empty() {
      let mut applier = LazyQueueApplier {
        runtime: &self.runtime,
        cached: &mut self.queue,
        actor: &self.reference,
      };
      let queue = applier.queue().await?;
      queue.add_all_to_queue(remaining.clone()).await?;
    }

    let recovered: BTreeSet<_> = remaining.iter().map(|record| record.workflow_id).collect();
    let changed = recovered != active;
    info!(
      actor = %self.reference,
      pending = recovered.len(),
      confirmed = active.len() - recovered.len(),
      "Recovered active workflows"
    );
    self.active_workflows = Some(recovered);
    Ok(changed)
  }

  /// Activation hook: move per-host entries left on another node here
  ///
  /// Runs after recovery, so the relocation record queues behind every
  /// workflow still pending from the previous host. Entries on a dead host
  /// are simply written again here. Returns whether the recorded host
  /// changed and must be persisted.
  pub async fn relocate_host_entries(&mut self) -> Result<bool> {
    let previous_host = match self.index_host {
      Some(host) if host == self.node => return Ok(false),
      Some(host) => host,
      None => {
        self.index_host = Some(self.node);
        return Ok(true);
      }
    };

    let mut eager = Vec::new();
    let mut lazy = BTreeMap::new();
    for (name, index) in &self.catalog.indexes {
      if index.metadata.kind != IndexKind::PerHostPartition {
        continue;
      }
      let Some(image) = self.before_images.get(name) else {
        continue;
      };
      match UpdatePath::select(self.catalog.fault_tolerant, &index.metadata) {
        UpdatePath::Eager => eager.push((Arc::clone(index), image.clone())),
        _ => {
          lazy.insert(name.clone(), MemberUpdate::insert(image.clone()));
        }
      }
    }

    let moved = eager.len() + lazy.len();
    for (index, image) in &eager {
      index
        .router
        .relocate(&self.reference, image, previous_host, self.node)
        .await
        .map_err(IndexingError::from)
        .map_err(disposed_as_stale(&self.catalog))?;
    }

    if !lazy.is_empty() {
      let id = self.fresh_workflow_id();
      let sequence = self.sequence + 1;
      let record =
        WorkflowRecord::new(id, self.reference.clone(), sequence, self.node, lazy).relocated_from(previous_host);
      let mut applier = LazyQueueApplier {
        runtime: &self.runtime,
        cached: &mut self.queue,
        actor: &self.reference,
      };
      applier.enqueue(record).await?;
      if let Some(active) = self.active_workflows.as_mut() {
        active.insert(id);
      }
      self.sequence = sequence;
    }

    if moved > 0 {
      info!(
        actor = %self.reference,
        from = %previous_host,
        to = %self.node,
        indexes = moved,
        "Relocated per-host index entries"
      );
    }
    self.index_host = Some(self.node);
    Ok(true)
  }

  async fn remaining_from_reincarnation(
    &mut self,
    queue_id: &WorkflowQueueId,
    active: &BTreeSet<WorkflowId>,
  ) -> Result<Vec<WorkflowRecord>> {
    let unreachable = |e: QueueError| IndexingError::QueueUnreachable(format!("{queue_id}: {e}"));
    let queue = self
      .runtime
      .queues()
      .resolve(&self.runtime, queue_id)
      .await
      .map_err(unreachable)?;
    let remaining = queue
      .get_remaining_workflows_in(&self.reference, active.clone())
      .await
      .map_err(unreachable)?;
    self.queue = Some(queue);
    Ok(remaining)
  }

  /// Compute and dispatch the index updates for `current → next`
  ///
  /// Nothing in this actor changes until [`IndexableActor::commit`] is
  /// called with the result. A stale index list is refreshed and the
  /// mutation retried up to the configured bound.
  pub async fn prepare_mutation(&mut self, current: &PropertyBag, next: &PropertyBag) -> Result<PendingCommit> {
    let max_retries = self.runtime.config().actor.max_stale_retries;
    let mut attempt = 0;
    loop {
      match self.try_mutation(next).await {
        Err(e) if e.is_stale_index_list() && attempt < max_retries => {
          attempt += 1;
          debug!(actor = %self.reference, attempt, "Index list stale, refreshing");
          self.refresh_catalog(current)?;
        }
        result => return result,
      }
    }
  }

  async fn try_mutation(&mut self, next: &PropertyBag) -> Result<PendingCommit> {
    self.runtime.registry().ensure_current(&self.catalog)?;

    let mut sync_updates: Vec<SyncUpdate> = Vec::new();
    let mut lazy = BTreeMap::new();
    for (name, index) in &self.catalog.indexes {
      let update = index.create_update(next, self.before_images.get(name));
      if update.is_noop() {
        continue;
      }
      match UpdatePath::select(self.catalog.fault_tolerant, &index.metadata) {
        UpdatePath::Eager => sync_updates.push((Arc::clone(index), update)),
        UpdatePath::Tentative => {
          sync_updates.push((Arc::clone(index), update.clone()));
          lazy.insert(name.clone(), update);
        }
        UpdatePath::Lazy => {
          lazy.insert(name.clone(), update);
        }
      }
    }

    let eager = EagerApplier {
      actor: self.reference.clone(),
      node: self.node,
    };
    let applied = eager.apply(&sync_updates).await.map_err(disposed_as_stale(&self.catalog))?;

    let sequence = self.sequence + 1;
    let workflow_id = if lazy.is_empty() {
      None
    } else {
      let id = self.fresh_workflow_id();
      let record = WorkflowRecord::new(id, self.reference.clone(), sequence, self.node, lazy);
      let mut applier = LazyQueueApplier {
        runtime: &self.runtime,
        cached: &mut self.queue,
        actor: &self.reference,
      };
      if let Err(e) = applier.enqueue(record).await {
        warn!(actor = %self.reference, error = %e, "Failed to enqueue index workflow, undoing synchronous updates");
        eager.compensate(&applied).await;
        return Err(e);
      }
      Some(id)
    };

    let before_images = self
      .catalog
      .indexes
      .iter()
      .filter_map(|(name, index)| index.extract_image(next).map(|image| (name.clone(), image)))
      .collect();

    Ok(PendingCommit {
      workflow_id,
      before_images,
      sequence,
      applied,
    })
  }

  /// Adopt a successful mutation
  pub fn commit(&mut self, pending: PendingCommit) -> CommitUndo {
    let undo = CommitUndo {
      before_images: std::mem::replace(&mut self.before_images, pending.before_images),
      active_workflows: self.active_workflows.clone(),
      sequence: self.sequence,
      applied: pending.applied,
    };
    if let (Some(id), Some(active)) = (pending.workflow_id, self.active_workflows.as_mut()) {
      active.insert(id);
    }
    self.sequence = pending.sequence;
    undo
  }

  /// Revert a commit whose actor state could not be made durable
  ///
  /// Synchronous index writes are compensated. The queued record stays in
  /// the queue: a fault-tolerant actor no longer lists it as active, so the
  /// handler treats it as an aborted mutation. Other types apply it anyway.
  pub async fn rollback(&mut self, undo: CommitUndo) {
    let eager = EagerApplier {
      actor: self.reference.clone(),
      node: self.node,
    };
    eager.compensate(&undo.applied).await;
    self.before_images = undo.before_images;
    self.active_workflows = undo.active_workflows;
    self.sequence = undo.sequence;
  }

  /// Drop workflows a handler confirmed; returns whether the set changed
  pub fn remove_active(&mut self, ids: &[WorkflowId]) -> bool {
    let Some(active) = self.active_workflows.as_mut() else {
      return false;
    };
    let before = active.len();
    for id in ids {
      active.remove(id);
    }
    before != active.len()
  }

  /// A random id not present in the active set
  ///
  /// Ids lost in a crash can still collide with records physically in the
  /// queue; that window is accepted.
  fn fresh_workflow_id(&self) -> WorkflowId {
    loop {
      let id = WorkflowId::new();
      if !self.active_workflows.as_ref().is_some_and(|active| active.contains(&id)) {
        return id;
      }
    }
  }

  fn refresh_catalog(&mut self, current: &PropertyBag) -> Result<()> {
    let actor_type = &self.reference.actor_type;
    self.catalog = self
      .runtime
      .registry()
      .catalog(actor_type)
      .ok_or_else(|| RegistryError::UnknownActorType(actor_type.clone()))?;
    self.seed_before_images(current);
    Ok(())
  }
}

/// A disposed bucket means the index was removed under us
fn disposed_as_stale(catalog: &TypeCatalog) -> impl Fn(IndexingError) -> IndexingError + '_ {
  move |e| match e {
    IndexingError::Index(IndexError::IndexNotAvailable {
      status: BucketStatus::Disposed,
      ..
    }) => IndexingError::Registry(RegistryError::StaleIndexList {
      actor_type: catalog.actor_type.clone(),
    }),
    other => other,
  }
}
