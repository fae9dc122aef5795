//! Index structures
//!
//! An index maps images to the set of actors currently holding that image.
//! Storage is split into buckets (shards), and a [`BucketRouter`] decides
//! which bucket owns a given key or actor:
//!
//! ```text
//! RegisteredIndex ─┬─ IndexMetaData (kind, unique, eager, storage)
//!                  ├─ IndexUpdateGenerator (properties → image)
//!                  └─ BucketRouter ─┬─ Single   → IndexBucket
//!                                   ├─ PerKey   → IndexBucket × partitions
//!                                   └─ PerHost  → IndexBucket × live nodes
//! ```

pub mod bucket;
pub mod generator;
pub mod metadata;
pub mod registry;
pub mod router;

pub use bucket::{BatchFailure, BatchOutcome, BucketId, BucketStats, BucketStatus, IndexBucket};
pub use generator::{CompositeGenerator, FnGenerator, IndexUpdateGenerator, PropertyGenerator};
pub use metadata::{ActorTypeConfig, IndexDeclaration, IndexKind, IndexMetaData};
pub use registry::{IndexRegistry, RegisteredIndex, RegistryError, TypeCatalog};
pub use router::{BatchItem, BucketOptions, BucketRouter, HostBuckets, PartitionHasher, StableHasher};

use crate::{
  domain::{
    actor::{ActorRef, IndexName, NodeAddress},
    image::Image,
  },
  storage::StorageError,
};

/// Errors raised by index buckets and routers
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
  #[error("Uniqueness violation on index {index}: key {key} is already owned by {existing}, rejected {actor}")]
  UniquenessViolation {
    index: IndexName,
    key: Image,
    existing: ActorRef,
    actor: ActorRef,
  },
  #[error("Index {index} is not available ({status:?})")]
  IndexNotAvailable { index: IndexName, status: BucketStatus },
  #[error("No actor found in index {index} for key {key}")]
  NotFound { index: IndexName, key: Image },
  #[error("Index {index} holds {count} actors for key {key}, expected one")]
  MultipleMatches { index: IndexName, key: Image, count: usize },
  #[error("No live node can host partition of index {index} for {node}")]
  HostUnavailable { index: IndexName, node: NodeAddress },
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
}

impl IndexError {
  pub fn is_uniqueness_violation(&self) -> bool {
    matches!(self, IndexError::UniquenessViolation { .. })
  }
}

pub type Result<T> = std::result::Result<T, IndexError>;
