use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
  actor::{ActorRef, IndexName, NodeAddress},
  update::MemberUpdate,
};

/// Identity of one deferred index-update workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }

  pub fn as_uuid(&self) -> &Uuid {
    &self.0
  }
}

impl Default for WorkflowId {
  fn default() -> Self {
    Self::new()
  }
}

impl From<Uuid> for WorkflowId {
  fn from(id: Uuid) -> Self {
    Self(id)
  }
}

impl fmt::Display for WorkflowId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The index updates produced by one actor mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
  pub workflow_id: WorkflowId,
  pub actor: ActorRef,
  /// Per-actor mutation counter
  pub sequence_number: u64,
  /// Node the actor was active on when it produced the record
  pub origin: NodeAddress,
  pub updates: BTreeMap<IndexName, MemberUpdate>,
  /// Set when the record relocates per-host entries after the actor moved
  /// off this node
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub previous_host: Option<NodeAddress>,
}

impl WorkflowRecord {
  pub fn new(
    workflow_id: WorkflowId,
    actor: ActorRef,
    sequence_number: u64,
    origin: NodeAddress,
    updates: BTreeMap<IndexName, MemberUpdate>,
  ) -> Self {
    Self {
      workflow_id,
      actor,
      sequence_number,
      origin,
      updates,
      previous_host: None,
    }
  }

  pub fn relocated_from(mut self, previous_host: NodeAddress) -> Self {
    self.previous_host = Some(previous_host);
    self
  }
}
