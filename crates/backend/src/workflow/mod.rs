//! Workflows - durable lazy index maintenance
//!
//! A mutation on a lazily indexed actor produces one [`WorkflowRecord`]
//! holding the per-index updates. Records go to the actor type's sharded
//! [`WorkflowQueue`]; a [`WorkflowQueueHandler`] drains each queue into the
//! index buckets in batches.
//!
//! ```text
//! IndexableActor ──add──▶ WorkflowQueue (durable list, one per type shard)
//!                              │ notify
//!                              ▼
//!                     WorkflowQueueHandler ──apply_batch──▶ BucketRouter
//!                              │
//!                              └─remove_from_active_workflows─▶ actor
//! ```
//!
//! When a queue's node fails, [`WorkflowQueueDirectory`] reincarnates the
//! queue on a live node from its persisted records.

pub mod directory;
pub mod handler;
pub mod queue;
pub mod record;

pub use directory::WorkflowQueueDirectory;
pub use handler::WorkflowQueueHandler;
pub use queue::{QueueError, QueueSettings, QueueStats, WorkflowQueue, WorkflowQueueHandle, WorkflowQueueId};
pub use record::{WorkflowId, WorkflowRecord};
