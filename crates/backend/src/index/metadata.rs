//! Index declarations and metadata
//!
//! Indexes are declared in a static registration table built at process
//! start: one [`ActorTypeConfig`] per actor type, each listing its
//! [`IndexDeclaration`]s.
//!
//! ```ignore
//! let player = ActorTypeConfig::new("Player")
//!   .index(IndexDeclaration::new("Location", PropertyGenerator::new("Location")).per_host())
//!   .index(IndexDeclaration::new("Email", PropertyGenerator::new("Email")).unique().eager());
//! ```

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use super::generator::IndexUpdateGenerator;
use crate::domain::actor::{ActorType, IndexName};

/// Partitioning policy of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexKind {
  /// One bucket for the whole index
  SingleBucket,
  /// `hash(key) mod partitions` buckets
  PerKeyPartition { partitions: usize },
  /// One bucket per cluster node, holding the actors active on that node
  PerHostPartition,
}

/// Immutable description of a registered index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetaData {
  pub kind: IndexKind,
  pub unique: bool,
  pub eager: bool,
  /// Storage binding for the index buckets (default binding when unset)
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub storage: Option<String>,
}

/// One index declared on an actor type
#[derive(Clone)]
pub struct IndexDeclaration {
  pub name: IndexName,
  pub metadata: IndexMetaData,
  pub generator: Arc<dyn IndexUpdateGenerator>,
}

impl IndexDeclaration {
  /// A lazy, non-unique, single-bucket index
  pub fn new(name: impl Into<String>, generator: impl IndexUpdateGenerator + 'static) -> Self {
    Self {
      name: IndexName::new(name),
      metadata: IndexMetaData {
        kind: IndexKind::SingleBucket,
        unique: false,
        eager: false,
        storage: None,
      },
      generator: Arc::new(generator),
    }
  }

  pub fn unique(mut self) -> Self {
    self.metadata.unique = true;
    self
  }

  pub fn eager(mut self) -> Self {
    self.metadata.eager = true;
    self
  }

  pub fn partitioned_by_key(mut self, partitions: usize) -> Self {
    self.metadata.kind = IndexKind::PerKeyPartition { partitions };
    self
  }

  pub fn per_host(mut self) -> Self {
    self.metadata.kind = IndexKind::PerHostPartition;
    self
  }

  pub fn storage(mut self, binding: impl Into<String>) -> Self {
    self.metadata.storage = Some(binding.into());
    self
  }
}

impl fmt::Debug for IndexDeclaration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IndexDeclaration")
      .field("name", &self.name)
      .field("metadata", &self.metadata)
      .finish_non_exhaustive()
  }
}

/// Per-actor-type indexing configuration
///
/// Replaces subclassing: whether an actor type is fault tolerant, where its
/// state lives, and which indexes it declares are all plain data.
#[derive(Debug, Clone)]
pub struct ActorTypeConfig {
  pub actor_type: ActorType,
  /// Track active workflows and run the recovery protocol on activation
  pub fault_tolerant: bool,
  /// Storage binding for actor state and workflow queues
  pub storage: Option<String>,
  pub indexes: Vec<IndexDeclaration>,
}

impl ActorTypeConfig {
  pub fn new(actor_type: impl Into<ActorType>) -> Self {
    Self {
      actor_type: actor_type.into(),
      fault_tolerant: false,
      storage: None,
      indexes: Vec::new(),
    }
  }

  pub fn fault_tolerant(mut self) -> Self {
    self.fault_tolerant = true;
    self
  }

  pub fn storage(mut self, binding: impl Into<String>) -> Self {
    self.storage = Some(binding.into());
    self
  }

  pub fn index(mut self, declaration: IndexDeclaration) -> Self {
    self.indexes.push(declaration);
    self
  }
}
