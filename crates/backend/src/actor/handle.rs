//! Grain handles
//!
//! Handles are cheap to clone and address one incarnation of a grain. Once
//! that incarnation stops (deactivation or node failure) every request fails
//! with [`SendError::ActorGone`]; callers go back to the directory for a
//! fresh handle.

use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot};

use super::{GrainError, message::GrainMessage};
use crate::{
  domain::{
    actor::{ActorRef, NodeAddress},
    image::{Image, PropertyBag, PropertyPatch},
  },
  workflow::WorkflowId,
};

#[derive(Clone, Debug)]
pub struct GrainHandle {
  reference: ActorRef,
  node: NodeAddress,
  incarnation: u64,
  tx: mpsc::Sender<GrainMessage>,
}

impl GrainHandle {
  pub(crate) fn new(reference: ActorRef, node: NodeAddress, incarnation: u64, tx: mpsc::Sender<GrainMessage>) -> Self {
    Self {
      reference,
      node,
      incarnation,
      tx,
    }
  }

  pub fn reference(&self) -> &ActorRef {
    &self.reference
  }

  /// Node hosting this incarnation
  pub fn node(&self) -> NodeAddress {
    self.node
  }

  pub fn incarnation(&self) -> u64 {
    self.incarnation
  }

  pub fn is_alive(&self) -> bool {
    !self.tx.is_closed()
  }

  async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> GrainMessage) -> Result<T, SendError> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(build(reply)).await.map_err(|_| SendError::ActorGone)?;
    rx.await.map_err(|_| SendError::ActorGone)
  }

  /// Apply a patch (`None` removes a property)
  pub async fn set_properties(&self, patch: PropertyPatch) -> Result<Option<WorkflowId>, GrainError> {
    self.request(|reply| GrainMessage::SetProperties { patch, reply }).await?
  }

  pub async fn set_property(&self, name: impl Into<String>, value: impl Into<Image>) -> Result<Option<WorkflowId>, GrainError> {
    let mut patch = PropertyPatch::new();
    patch.insert(name.into(), Some(value.into()));
    self.set_properties(patch).await
  }

  pub async fn clear_property(&self, name: impl Into<String>) -> Result<Option<WorkflowId>, GrainError> {
    let mut patch = PropertyPatch::new();
    patch.insert(name.into(), None);
    self.set_properties(patch).await
  }

  pub async fn get_properties(&self) -> Result<PropertyBag, SendError> {
    self.request(|reply| GrainMessage::GetProperties { reply }).await
  }

  pub async fn get_active_workflows(&self) -> Result<Option<BTreeSet<WorkflowId>>, SendError> {
    self.request(|reply| GrainMessage::GetActiveWorkflows { reply }).await
  }

  pub async fn remove_from_active_workflows(&self, ids: Vec<WorkflowId>) -> Result<(), GrainError> {
    self
      .request(|reply| GrainMessage::RemoveFromActiveWorkflows { ids, reply })
      .await?
  }

  /// Stop this incarnation; resolves once the grain has stopped
  pub async fn deactivate(&self) -> Result<(), SendError> {
    self.request(|reply| GrainMessage::Deactivate { reply }).await
  }
}

/// Error when sending to an actor
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Actor has shut down")]
  ActorGone,
}
