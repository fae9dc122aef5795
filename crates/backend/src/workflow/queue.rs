//! WorkflowQueue - durable per-(actor type, shard) log of pending index updates
//!
//! One queue instance runs per `(actor type, shard)` on one node. Every
//! change to its record list is persisted before it is acknowledged, so a
//! queue reincarnated on another node after a crash reloads exactly the
//! records that were not yet confirmed applied.
//!
//! ```text
//!  IndexableActor ──add──▶ ┌───────────────┐ ◀──give_more── WorkflowQueueHandler
//!                          │ WorkflowQueue │ ──batch──────▶      │
//!  recovery ──get_remaining│  pending      │ ◀──remove_all──     │ (applied)
//!                          │  in_flight    │ ◀──release───       │ (retry later)
//!                          └───────────────┘
//! ```
//!
//! Records handed to the handler stay durable until `remove_all`; `release`
//! puts them back at the head of the pending list.

use std::{
  collections::{BTreeSet, HashMap, HashSet, VecDeque},
  fmt,
  str::FromStr,
  sync::Arc,
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
  sync::{Notify, mpsc, oneshot},
  time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::record::{WorkflowId, WorkflowRecord};
use crate::{
  domain::actor::{ActorRef, ActorType, NodeAddress},
  storage::{StorageError, StorageProvider},
};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("Workflow queue {0} is unreachable")]
  Unreachable(String),
  #[error("Invalid workflow queue id: {0}")]
  InvalidId(String),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ============================================================================
// Identity
// ============================================================================

/// `(actor type, shard)` identity of a queue, rendered as `Type#shard`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkflowQueueId {
  pub actor_type: ActorType,
  pub shard: usize,
}

impl WorkflowQueueId {
  pub fn new(actor_type: ActorType, shard: usize) -> Self {
    Self { actor_type, shard }
  }

  /// Queue owning `actor`'s workflows
  pub fn for_actor(actor: &ActorRef, shard_count: usize) -> Self {
    let shard = (actor.id_hash() % shard_count.max(1) as u64) as usize;
    Self::new(actor.actor_type.clone(), shard)
  }

  pub fn storage_key(&self) -> String {
    format!("workflow-queue/{}/{}", self.actor_type, self.shard)
  }
}

impl fmt::Display for WorkflowQueueId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.actor_type, self.shard)
  }
}

impl FromStr for WorkflowQueueId {
  type Err = QueueError;

  fn from_str(s: &str) -> Result<Self> {
    let (actor_type, shard) = s.rsplit_once('#').ok_or_else(|| QueueError::InvalidId(s.to_string()))?;
    if actor_type.is_empty() {
      return Err(QueueError::InvalidId(s.to_string()));
    }
    let shard = shard.parse().map_err(|_| QueueError::InvalidId(s.to_string()))?;
    Ok(Self::new(ActorType::new(actor_type), shard))
  }
}

// ============================================================================
// Messages & Handle
// ============================================================================

pub enum QueueMessage {
  Add {
    record: WorkflowRecord,
    reply: oneshot::Sender<Result<()>>,
  },
  AddAll {
    records: Vec<WorkflowRecord>,
    reply: oneshot::Sender<Result<usize>>,
  },
  GetRemaining {
    actor: ActorRef,
    active: BTreeSet<WorkflowId>,
    reply: oneshot::Sender<Vec<WorkflowRecord>>,
  },
  GiveMore {
    reply: oneshot::Sender<Option<Vec<WorkflowRecord>>>,
  },
  RemoveAll {
    ids: Vec<WorkflowId>,
    reply: oneshot::Sender<Result<()>>,
  },
  Release {
    ids: Vec<WorkflowId>,
    reply: oneshot::Sender<()>,
  },
  Stats {
    reply: oneshot::Sender<QueueStats>,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: usize,
  pub in_flight: usize,
}

impl QueueStats {
  pub fn total(&self) -> usize {
    self.pending + self.in_flight
  }
}

/// Handle to one incarnation of a workflow queue
#[derive(Clone, Debug)]
pub struct WorkflowQueueHandle {
  id: WorkflowQueueId,
  node: NodeAddress,
  incarnation: u64,
  tx: mpsc::Sender<QueueMessage>,
}

impl WorkflowQueueHandle {
  pub fn id(&self) -> &WorkflowQueueId {
    &self.id
  }

  pub fn node(&self) -> NodeAddress {
    self.node
  }

  pub fn incarnation(&self) -> u64 {
    self.incarnation
  }

  pub fn is_alive(&self) -> bool {
    !self.tx.is_closed()
  }

  async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> QueueMessage) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(build(reply))
      .await
      .map_err(|_| QueueError::Unreachable(self.id.to_string()))?;
    rx.await.map_err(|_| QueueError::Unreachable(self.id.to_string()))
  }

  pub async fn add_to_queue(&self, record: WorkflowRecord) -> Result<()> {
    self.request(|reply| QueueMessage::Add { record, reply }).await?
  }

  /// Bulk add used by recovery replay; records already queued are skipped
  pub async fn add_all_to_queue(&self, records: Vec<WorkflowRecord>) -> Result<usize> {
    self.request(|reply| QueueMessage::AddAll { records, reply }).await?
  }

  /// Queued records of `actor` whose ids are in `active`
  pub async fn get_remaining_workflows_in(
    &self,
    actor: &ActorRef,
    active: BTreeSet<WorkflowId>,
  ) -> Result<Vec<WorkflowRecord>> {
    let actor = actor.clone();
    self
      .request(|reply| QueueMessage::GetRemaining { actor, active, reply })
      .await
  }

  /// Next batch for the handler, or `None` when the queue is drained
  pub async fn give_more_workflows_or_set_as_idle(&self) -> Result<Option<Vec<WorkflowRecord>>> {
    self.request(|reply| QueueMessage::GiveMore { reply }).await
  }

  pub async fn remove_all_workflows(&self, ids: Vec<WorkflowId>) -> Result<()> {
    self.request(|reply| QueueMessage::RemoveAll { ids, reply }).await?
  }

  pub async fn release(&self, ids: Vec<WorkflowId>) -> Result<()> {
    self.request(|reply| QueueMessage::Release { ids, reply }).await
  }

  pub async fn stats(&self) -> Result<QueueStats> {
    self.request(|reply| QueueMessage::Stats { reply }).await
  }
}

// ============================================================================
// Queue Actor
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedQueue {
  records: Vec<WorkflowRecord>,
}

/// Settings for one queue instance
#[derive(Debug, Clone)]
pub struct QueueSettings {
  pub max_batch_size: usize,
  pub idle_timeout: Duration,
  pub mailbox_capacity: usize,
}

pub struct WorkflowQueue {
  id: WorkflowQueueId,
  node: NodeAddress,
  settings: QueueSettings,
  storage: Arc<dyn StorageProvider>,
  rx: mpsc::Receiver<QueueMessage>,
  /// Wakes this queue's handler when records arrive
  notify: Arc<Notify>,
  cancel: CancellationToken,

  records: HashMap<WorkflowId, WorkflowRecord>,
  pending: VecDeque<WorkflowId>,
  in_flight: Vec<WorkflowId>,
  by_actor: HashMap<ActorRef, BTreeSet<WorkflowId>>,
}

impl WorkflowQueue {
  /// Load the durable queue state and start the queue task
  ///
  /// Returns the handle and the notifier the queue's handler waits on. The
  /// task stops when `cancel` fires (node failure) or after idling empty for
  /// `idle_timeout`, in which case it cancels `cancel` itself so the handler
  /// stops too.
  pub async fn spawn(
    id: WorkflowQueueId,
    node: NodeAddress,
    incarnation: u64,
    settings: QueueSettings,
    storage: Arc<dyn StorageProvider>,
    cancel: CancellationToken,
  ) -> Result<(WorkflowQueueHandle, Arc<Notify>)> {
    let persisted = storage
      .load_json::<PersistedQueue>(&id.storage_key())
      .await?
      .unwrap_or_default();

    let (tx, rx) = mpsc::channel(settings.mailbox_capacity.max(1));
    let notify = Arc::new(Notify::new());
    let mut queue = Self {
      id: id.clone(),
      node,
      settings,
      storage,
      rx,
      notify: Arc::clone(&notify),
      cancel,
      records: HashMap::new(),
      pending: VecDeque::new(),
      in_flight: Vec::new(),
      by_actor: HashMap::new(),
    };
    for record in persisted.records {
      queue.push_back(record);
    }
    if !queue.pending.is_empty() {
      info!(queue = %id, node = %node, records = queue.pending.len(), "Workflow queue recovered pending records");
      queue.notify.notify_one();
    }

    tokio::spawn(queue.run());
    Ok((
      WorkflowQueueHandle {
        id,
        node,
        incarnation,
        tx,
      },
      notify,
    ))
  }

  async fn run(mut self) {
    debug!(queue = %self.id, node = %self.node, "Workflow queue started");
    let mut deadline = Instant::now() + self.settings.idle_timeout;

    loop {
      tokio::select! {
          biased;

          _ = self.cancel.cancelled() => {
              debug!(queue = %self.id, "Workflow queue shutting down (cancelled)");
              break;
          }

          msg = self.rx.recv() => {
              match msg {
                  Some(msg) => {
                      // Every access keeps the queue alive
                      deadline = Instant::now() + self.settings.idle_timeout;
                      self.handle(msg).await;
                  }
                  None => break,
              }
          }

          _ = sleep_until(deadline) => {
              if self.records.is_empty() {
                  info!(queue = %self.id, node = %self.node, "Workflow queue idle, deactivating");
                  self.cancel.cancel();
                  break;
              }
              deadline = Instant::now() + self.settings.idle_timeout;
          }
      }
    }
  }

  async fn handle(&mut self, msg: QueueMessage) {
    match msg {
      QueueMessage::Add { record, reply } => {
        let _ = reply.send(self.add(vec![record]).await.map(|_| ()));
      }
      QueueMessage::AddAll { records, reply } => {
        let _ = reply.send(self.add(records).await);
      }
      QueueMessage::GetRemaining { actor, active, reply } => {
        let _ = reply.send(self.remaining(&actor, &active));
      }
      QueueMessage::GiveMore { reply } => {
        let _ = reply.send(self.give_more());
      }
      QueueMessage::RemoveAll { ids, reply } => {
        let _ = reply.send(self.remove_all(ids).await);
      }
      QueueMessage::Release { ids, reply } => {
        self.release(ids);
        let _ = reply.send(());
      }
      QueueMessage::Stats { reply } => {
        let _ = reply.send(QueueStats {
          pending: self.pending.len(),
          in_flight: self.in_flight.len(),
        });
      }
    }
  }

  fn push_back(&mut self, record: WorkflowRecord) -> bool {
    if self.records.contains_key(&record.workflow_id) {
      return false;
    }
    let id = record.workflow_id;
    self.by_actor.entry(record.actor.clone()).or_default().insert(id);
    self.records.insert(id, record);
    self.pending.push_back(id);
    true
  }

  fn forget(&mut self, id: &WorkflowId) -> Option<WorkflowRecord> {
    let record = self.records.remove(id)?;
    if let Some(ids) = self.by_actor.get_mut(&record.actor) {
      ids.remove(id);
      if ids.is_empty() {
        self.by_actor.remove(&record.actor);
      }
    }
    Some(record)
  }

  async fn add(&mut self, records: Vec<WorkflowRecord>) -> Result<usize> {
    let mut added = Vec::new();
    for record in records {
      let id = record.workflow_id;
      if self.push_back(record) {
        added.push(id);
      }
    }
    if added.is_empty() {
      return Ok(0);
    }

    if let Err(e) = self.persist().await {
      warn!(queue = %self.id, error = %e, "Failed to persist workflow queue, rejecting records");
      let added: HashSet<_> = added.into_iter().collect();
      self.pending.retain(|id| !added.contains(id));
      for id in &added {
        self.forget(id);
      }
      return Err(e);
    }

    trace!(queue = %self.id, added = added.len(), pending = self.pending.len(), "Workflows queued");
    self.notify.notify_one();
    Ok(added.len())
  }

  fn remaining(&self, actor: &ActorRef, active: &BTreeSet<WorkflowId>) -> Vec<WorkflowRecord> {
    let Some(queued) = self.by_actor.get(actor) else {
      return Vec::new();
    };
    let mut found: Vec<_> = queued
      .intersection(active)
      .filter_map(|id| self.records.get(id).cloned())
      .collect();
    found.sort_by_key(|record| record.sequence_number);
    found
  }

  fn give_more(&mut self) -> Option<Vec<WorkflowRecord>> {
    if self.pending.is_empty() {
      trace!(queue = %self.id, "Workflow queue drained, handler idle");
      return None;
    }
    let take = self.pending.len().min(self.settings.max_batch_size.max(1));
    let batch: Vec<_> = self
      .pending
      .drain(..take)
      .filter_map(|id| self.records.get(&id).cloned())
      .collect();
    self.in_flight.extend(batch.iter().map(|record| record.workflow_id));
    Some(batch)
  }

  async fn remove_all(&mut self, ids: Vec<WorkflowId>) -> Result<()> {
    let ids: HashSet<_> = ids.into_iter().collect();
    let mut removed = Vec::new();
    for id in &ids {
      if let Some(record) = self.forget(id) {
        removed.push(record);
      }
    }
    self.in_flight.retain(|id| !ids.contains(id));
    self.pending.retain(|id| !ids.contains(id));
    if removed.is_empty() {
      return Ok(());
    }

    if let Err(e) = self.persist().await {
      warn!(queue = %self.id, error = %e, "Failed to persist workflow removal, keeping records");
      for record in removed {
        let id = record.workflow_id;
        self.by_actor.entry(record.actor.clone()).or_default().insert(id);
        self.records.insert(id, record);
        self.pending.push_front(id);
      }
      return Err(e);
    }
    trace!(queue = %self.id, removed = removed.len(), "Workflows removed");
    Ok(())
  }

  fn release(&mut self, ids: Vec<WorkflowId>) {
    let ids: HashSet<_> = ids.into_iter().collect();
    let mut released: Vec<_> = self.in_flight.iter().copied().filter(|id| ids.contains(id)).collect();
    self.in_flight.retain(|id| !ids.contains(id));
    // Back to the head, keeping their original order
    released.reverse();
    for id in released {
      self.pending.push_front(id);
    }
  }

  async fn persist(&self) -> Result<()> {
    let records: Vec<_> = self
      .in_flight
      .iter()
      .chain(self.pending.iter())
      .filter_map(|id| self.records.get(id).cloned())
      .collect();
    self
      .storage
      .save_json(&self.id.storage_key(), &PersistedQueue { records })
      .await?;
    Ok(())
  }
}
