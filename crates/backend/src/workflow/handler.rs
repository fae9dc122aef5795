//! WorkflowQueueHandler - drains one workflow queue into the index buckets
//!
//! The handler sleeps until its queue signals new records, then pulls
//! batches until the queue reports idle. Per batch:
//!
//! 1. Fault-tolerant types: ask every distinct actor (concurrently) which
//!    workflows it still considers active
//! 2. Active records feed per-index batches; consecutive updates of the
//!    same actor on the same index are combined into one
//! 3. Inactive records contribute reverse-tentative updates for their
//!    unique indexes only, undoing writes of mutations that never committed
//! 4. Every index batch is applied with one router call, all concurrently
//! 5. Processed records are removed durably, then the actors are told to
//!    drop the ids from their active sets
//!
//! Records whose actor could not be queried, or whose batch hit a storage
//! failure, are released back to the queue and retried after a backoff.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  sync::Arc,
  time::Duration,
};

use futures::future::join_all;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{
  queue::WorkflowQueueHandle,
  record::{WorkflowId, WorkflowRecord},
};
use crate::{
  actor::GrainError,
  domain::{
    actor::{ActorRef, IndexName},
    update::MemberUpdate,
  },
  index::{BatchItem, BucketStatus, IndexError, TypeCatalog},
  runtime::Runtime,
};

pub struct WorkflowQueueHandler {
  runtime: Arc<Runtime>,
  queue: WorkflowQueueHandle,
  notify: Arc<Notify>,
  retry_backoff: Duration,
  cancel: CancellationToken,
}

/// How a batch split up after asking the actors
#[derive(Default)]
struct Classified {
  active: Vec<WorkflowRecord>,
  inactive: Vec<WorkflowRecord>,
  unreachable: Vec<WorkflowId>,
}

impl WorkflowQueueHandler {
  pub fn spawn(
    runtime: Arc<Runtime>,
    queue: WorkflowQueueHandle,
    notify: Arc<Notify>,
    retry_backoff: Duration,
    cancel: CancellationToken,
  ) {
    let handler = Self {
      runtime,
      queue,
      notify,
      retry_backoff,
      cancel,
    };
    tokio::spawn(handler.run());
  }

  async fn run(self) {
    debug!(queue = %self.queue.id(), "Workflow queue handler started");
    loop {
      tokio::select! {
          biased;

          _ = self.cancel.cancelled() => {
              debug!(queue = %self.queue.id(), "Workflow queue handler stopping");
              break;
          }

          _ = self.notify.notified() => self.drain().await,
      }
    }
  }

  async fn drain(&self) {
    loop {
      if self.cancel.is_cancelled() {
        return;
      }
      match self.queue.give_more_workflows_or_set_as_idle().await {
        Ok(Some(batch)) => {
          if !self.process(batch).await {
            tokio::time::sleep(self.retry_backoff).await;
          }
        }
        Ok(None) => return,
        Err(e) => {
          debug!(queue = %self.queue.id(), error = %e, "Workflow queue gone");
          return;
        }
      }
    }
  }

  /// Process one batch; false when some records were released for retry
  async fn process(&self, batch: Vec<WorkflowRecord>) -> bool {
    let queue_id = self.queue.id();
    let Some(catalog) = self.runtime.registry().catalog(&queue_id.actor_type) else {
      warn!(queue = %queue_id, "Dropping workflows of unregistered actor type");
      let ids = batch.iter().map(|record| record.workflow_id).collect();
      return self.queue.remove_all_workflows(ids).await.is_ok();
    };

    let classified = self.classify(&catalog, batch).await;
    let batches = build_index_batches(&catalog, &classified);
    trace!(
      queue = %queue_id,
      active = classified.active.len(),
      inactive = classified.inactive.len(),
      unreachable = classified.unreachable.len(),
      indexes = batches.len(),
      "Processing workflow batch"
    );

    let storage_failed = !self.apply(&catalog, batches).await;

    let processed: Vec<_> = classified
      .active
      .iter()
      .chain(classified.inactive.iter())
      .map(|record| record.workflow_id)
      .collect();

    if storage_failed {
      let mut retry = processed;
      retry.extend(classified.unreachable.iter().copied());
      self.release(retry).await;
      return false;
    }

    if let Err(e) = self.queue.remove_all_workflows(processed.clone()).await {
      warn!(queue = %queue_id, error = %e, "Failed to remove applied workflows");
      let mut retry = processed;
      retry.extend(classified.unreachable.iter().copied());
      self.release(retry).await;
      return false;
    }

    if catalog.fault_tolerant {
      self.confirm(&classified.active).await;
    }

    if classified.unreachable.is_empty() {
      true
    } else {
      self.release(classified.unreachable).await;
      false
    }
  }

  async fn classify(&self, catalog: &TypeCatalog, batch: Vec<WorkflowRecord>) -> Classified {
    if !catalog.fault_tolerant {
      return Classified {
        active: batch,
        ..Classified::default()
      };
    }

    let actors: BTreeSet<ActorRef> = batch.iter().map(|record| record.actor.clone()).collect();
    let answers = join_all(actors.into_iter().map(|actor| async move {
      let active = self.active_workflows(&actor).await;
      (actor, active)
    }))
    .await;
    let answers: HashMap<_, _> = answers.into_iter().collect();

    let mut classified = Classified::default();
    for record in batch {
      match answers.get(&record.actor) {
        Some(Ok(active)) if active.contains(&record.workflow_id) => classified.active.push(record),
        Some(Ok(_)) => classified.inactive.push(record),
        _ => classified.unreachable.push(record.workflow_id),
      }
    }
    classified
  }

  async fn active_workflows(&self, actor: &ActorRef) -> Result<BTreeSet<WorkflowId>, GrainError> {
    let handle = self.runtime.grain(actor).await?;
    let active = handle.get_active_workflows().await?;
    Ok(active.unwrap_or_default())
  }

  /// Apply all index batches concurrently; false on a storage failure
  async fn apply(&self, catalog: &TypeCatalog, batches: BTreeMap<IndexName, Vec<BatchItem>>) -> bool {
    let results = join_all(batches.into_iter().map(|(name, items)| async move {
      let Some(index) = catalog.get(&name) else {
        warn!(index = %name, "Skipping updates for unknown index");
        return (name, Ok(None));
      };
      let outcome = index.router.apply_batch(items).await;
      (name, outcome.map(Some))
    }))
    .await;

    let mut ok = true;
    for (name, result) in results {
      match result {
        Ok(Some(outcome)) => {
          for failure in &outcome.failures {
            warn!(
              index = %name,
              actor = %failure.actor,
              op = ?failure.update.operation(),
              error = %failure.error,
              "Index update rejected"
            );
          }
        }
        Ok(None) => {}
        Err(IndexError::IndexNotAvailable {
          status: BucketStatus::Disposed,
          ..
        }) => debug!(index = %name, "Skipping updates for disposed index"),
        Err(e) => {
          error!(index = %name, error = %e, "Failed to apply index batch");
          ok = false;
        }
      }
    }
    ok
  }

  /// Tell active actors their workflows are applied (best effort)
  async fn confirm(&self, active: &[WorkflowRecord]) {
    let mut by_actor: BTreeMap<&ActorRef, Vec<WorkflowId>> = BTreeMap::new();
    for record in active {
      by_actor.entry(&record.actor).or_default().push(record.workflow_id);
    }

    join_all(by_actor.into_iter().map(|(actor, ids)| async move {
      let Some(handle) = self.runtime.grains().get_active(&self.runtime, actor) else {
        return;
      };
      if let Err(e) = handle.remove_from_active_workflows(ids).await {
        debug!(actor = %actor, error = %e, "Could not trim active workflows");
      }
    }))
    .await;
  }

  async fn release(&self, ids: Vec<WorkflowId>) {
    if ids.is_empty() {
      return;
    }
    debug!(queue = %self.queue.id(), count = ids.len(), "Releasing workflows for retry");
    if let Err(e) = self.queue.release(ids).await {
      debug!(queue = %self.queue.id(), error = %e, "Failed to release workflows");
    }
  }
}

/// Group record updates per index
fn build_index_batches(catalog: &TypeCatalog, classified: &Classified) -> BTreeMap<IndexName, Vec<BatchItem>> {
  let mut batches: BTreeMap<IndexName, Vec<BatchItem>> = BTreeMap::new();

  for record in &classified.active {
    for (name, update) in &record.updates {
      push_combined(batches.entry(name.clone()).or_default(), record, update.clone());
    }
  }

  for record in &classified.inactive {
    for (name, update) in &record.updates {
      if catalog.get(name).is_some_and(|index| index.is_unique()) {
        batches.entry(name.clone()).or_default().push(BatchItem::new(
          record.actor.clone(),
          update.reverse_tentative(),
          record.origin,
        ));
      }
    }
  }

  batches.retain(|_, items| !items.is_empty());
  batches
}

/// Append, folding into the previous item when it is the same actor's
///
/// Updates from different hosts and relocations are never folded; each
/// has to reach its own host bucket.
fn push_combined(items: &mut Vec<BatchItem>, record: &WorkflowRecord, update: MemberUpdate) {
  if let Some(last) = items.last_mut()
    && last.actor == record.actor
    && last.origin == record.origin
    && last.previous_host.is_none()
    && record.previous_host.is_none()
  {
    last.update = MemberUpdate::combine(&last.update, &update);
    if last.update.is_noop() {
      items.pop();
    }
    return;
  }
  items.push(BatchItem {
    previous_host: record.previous_host,
    ..BatchItem::new(record.actor.clone(), update, record.origin)
  });
}
