//! WorkflowQueueDirectory - resolves `(actor type, shard)` to a live queue
//!
//! A queue is pinned to the node chosen by stable placement of its id. When
//! that node dies the cached handle goes dead; the next resolution spawns a
//! reincarnated queue (and its handler) on a live node, which reloads the
//! durable record list.

use std::{
  str::FromStr,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
  handler::WorkflowQueueHandler,
  queue::{QueueError, QueueSettings, WorkflowQueue, WorkflowQueueHandle, WorkflowQueueId},
};
use crate::{
  domain::{
    actor::{ActorRef, NodeAddress},
    stable_hash,
  },
  runtime::Runtime,
};

pub struct WorkflowQueueDirectory {
  queues: DashMap<WorkflowQueueId, WorkflowQueueHandle>,
  spawn_lock: Mutex<()>,
  incarnations: AtomicU64,
  shard_count: usize,
}

impl WorkflowQueueDirectory {
  pub fn new(shard_count: usize) -> Self {
    Self {
      queues: DashMap::new(),
      spawn_lock: Mutex::new(()),
      incarnations: AtomicU64::new(0),
      shard_count: shard_count.max(1),
    }
  }

  pub fn shard_count(&self) -> usize {
    self.shard_count
  }

  pub fn queue_id_for(&self, actor: &ActorRef) -> WorkflowQueueId {
    WorkflowQueueId::for_actor(actor, self.shard_count)
  }

  /// Last handle handed out for `id`, dead or alive
  pub fn cached(&self, id: &WorkflowQueueId) -> Option<WorkflowQueueHandle> {
    self.queues.get(id).map(|h| h.value().clone())
  }

  /// A live handle for `id`, spawning or reincarnating the queue if needed
  pub async fn resolve(&self, runtime: &Arc<Runtime>, id: &WorkflowQueueId) -> Result<WorkflowQueueHandle, QueueError> {
    if let Some(handle) = self.cached(id).filter(|h| runtime.is_queue_live(h)) {
      return Ok(handle);
    }

    let _guard = self.spawn_lock.lock().await;
    let previous = self.cached(id);
    if let Some(handle) = previous.as_ref().filter(|h| runtime.is_queue_live(h)) {
      return Ok(handle.clone());
    }

    let node = runtime
      .cluster()
      .place(stable_hash(id.to_string().as_bytes()))
      .ok_or_else(|| QueueError::Unreachable(id.to_string()))?;
    let cancel = runtime
      .cluster()
      .node_token(node)
      .ok_or_else(|| QueueError::Unreachable(id.to_string()))?
      .child_token();

    // The new incarnation only knows the id string it was assigned
    let assigned = id.to_string();
    let identity = WorkflowQueueId::from_str(&assigned)?;

    let storage = runtime
      .registry()
      .catalog(&identity.actor_type)
      .map(|catalog| runtime.storage().resolve(catalog.storage.as_deref()))
      .unwrap_or_else(|| runtime.storage().default_provider())?;

    let config = &runtime.config().queue;
    let settings = QueueSettings {
      max_batch_size: config.max_batch_size,
      idle_timeout: config.idle_timeout(),
      mailbox_capacity: runtime.config().actor.mailbox_capacity,
    };
    let incarnation = self.incarnations.fetch_add(1, Ordering::SeqCst) + 1;

    let (handle, notify) = WorkflowQueue::spawn(identity, node, incarnation, settings, storage, cancel.clone()).await?;
    WorkflowQueueHandler::spawn(
      Arc::clone(runtime),
      handle.clone(),
      notify,
      config.retry_backoff(),
      cancel,
    );

    match previous {
      Some(old) => warn!(queue = %id, from = %old.node(), to = %node, incarnation, "Reincarnating workflow queue"),
      None => info!(queue = %id, node = %node, incarnation, "Activated workflow queue"),
    }
    self.queues.insert(id.clone(), handle.clone());
    Ok(handle)
  }

  /// Reincarnate every queue that was hosted on `node`
  pub async fn reincarnate_hosted_on(&self, runtime: &Arc<Runtime>, node: NodeAddress) {
    let hosted: Vec<_> = self
      .queues
      .iter()
      .filter(|entry| entry.value().node() == node)
      .map(|entry| entry.key().clone())
      .collect();
    for id in hosted {
      if let Err(e) = self.resolve(runtime, &id).await {
        warn!(queue = %id, error = %e, "Failed to reincarnate workflow queue");
      }
    }
  }

  /// Live queue handles
  pub fn live(&self, runtime: &Runtime) -> Vec<WorkflowQueueHandle> {
    let mut live: Vec<_> = self
      .queues
      .iter()
      .map(|entry| entry.value().clone())
      .filter(|handle| runtime.is_queue_live(handle))
      .collect();
    live.sort_by(|a, b| a.id().cmp(b.id()));
    live
  }
}
