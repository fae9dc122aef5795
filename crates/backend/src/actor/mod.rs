//! Grains and their indexing behavior
//!
//! Each activated grain runs as its own task with an `mpsc` mailbox and
//! processes one message at a time. Handles are cheap to clone; the
//! [`GrainDirectory`] guarantees at most one live activation per actor.
//!
//! # Components
//!
//! - [`GrainDirectory`]: activates grains on demand on a live node
//! - [`GrainHandle`]: request methods against one activation
//! - [`IndexableActor`]: before-image cache, eager/lazy dispatch, and
//!   activation-time recovery of pending workflows
//!
//! ```text
//! caller ──▶ GrainHandle ──mpsc──▶ Grain task
//!                                   ├─ PropertyBag
//!                                   └─ IndexableActor ──▶ buckets (eager)
//!                                                     └─▶ WorkflowQueue (lazy)
//! ```

mod grain;
pub mod handle;
pub mod indexable;
pub mod message;
mod router;

#[cfg(test)]
mod __tests__;

pub use handle::{GrainHandle, SendError};
pub use indexable::{IndexableActor, IndexingError, UpdatePath};
pub use router::GrainDirectory;

use crate::{domain::actor::ActorType, storage::StorageError};

#[derive(Debug, thiserror::Error)]
pub enum GrainError {
  #[error("Indexing error: {0}")]
  Indexing(#[from] IndexingError),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
  #[error("Send error: {0}")]
  Send(#[from] SendError),
  #[error("Unknown actor type: {0}")]
  UnknownActorType(ActorType),
  #[error("No live node can host the grain")]
  NoLiveNodes,
}

impl GrainError {
  pub fn is_uniqueness_violation(&self) -> bool {
    matches!(self, GrainError::Indexing(e) if e.is_uniqueness_violation())
  }
}
