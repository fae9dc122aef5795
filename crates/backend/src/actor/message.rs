//! Grain message types
//!
//! Every request carries a `oneshot` reply channel; grains answer exactly
//! once, after the request's effects (including index maintenance and the
//! durable state write) are complete.

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use super::GrainError;
use crate::{
  domain::image::{PropertyBag, PropertyPatch},
  workflow::WorkflowId,
};

#[derive(Debug)]
pub enum GrainMessage {
  /// Apply a property patch; replies with the workflow id of any deferred
  /// index updates it produced
  SetProperties {
    patch: PropertyPatch,
    reply: oneshot::Sender<Result<Option<WorkflowId>, GrainError>>,
  },
  GetProperties {
    reply: oneshot::Sender<PropertyBag>,
  },
  /// `None` for actor types that are not fault tolerant
  GetActiveWorkflows {
    reply: oneshot::Sender<Option<BTreeSet<WorkflowId>>>,
  },
  /// Sent by a queue handler once the workflows are durably applied
  RemoveFromActiveWorkflows {
    ids: Vec<WorkflowId>,
    reply: oneshot::Sender<Result<(), GrainError>>,
  },
  Deactivate {
    reply: oneshot::Sender<()>,
  },
}
