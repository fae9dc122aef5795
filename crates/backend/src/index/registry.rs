//! IndexRegistry - process-scoped catalog of declared indexes
//!
//! The registry owns one [`TypeCatalog`] per actor type. Catalogs are
//! immutable snapshots: adding or removing an index builds a new catalog with
//! a bumped version and swaps it in, so an actor holding an older `Arc`
//! keeps a consistent view until it asks [`IndexRegistry::ensure_current`].
//!
//! Index names are unique across all actor types. Each catalog's metadata is
//! persisted under `registry/{actor type}` on the default storage binding.

use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  sync::Arc,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
  IndexError,
  bucket::BucketStatus,
  generator::IndexUpdateGenerator,
  metadata::{ActorTypeConfig, IndexDeclaration, IndexKind, IndexMetaData},
  router::{BucketOptions, BucketRouter},
};
use crate::{
  cluster::Membership,
  domain::{
    actor::{ActorType, IndexName},
    config::BucketConfig,
    image::{Image, PropertyBag},
    update::MemberUpdate,
  },
  storage::{StorageBindings, StorageError},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("Eager index {index} on fault-tolerant actor type {actor_type} is not implemented")]
  NotImplemented { actor_type: ActorType, index: IndexName },
  #[error("Index {0} cannot be both unique and partitioned per host")]
  UniquePerHost(IndexName),
  #[error("Index {0} is already registered")]
  DuplicateIndex(IndexName),
  #[error("Actor type {0} is already registered")]
  DuplicateActorType(ActorType),
  #[error("Index {0} needs at least one partition")]
  InvalidPartitions(IndexName),
  #[error("Unknown actor type: {0}")]
  UnknownActorType(ActorType),
  #[error("Unknown index: {0}")]
  UnknownIndex(IndexName),
  #[error("Index list of {actor_type} changed since it was cached")]
  StaleIndexList { actor_type: ActorType },
  #[error("Index error: {0}")]
  Index(#[from] IndexError),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ============================================================================
// Catalog
// ============================================================================

/// An index bound to its generator and buckets
pub struct RegisteredIndex {
  pub name: IndexName,
  pub actor_type: ActorType,
  pub metadata: IndexMetaData,
  pub generator: Arc<dyn IndexUpdateGenerator>,
  pub router: BucketRouter,
}

impl RegisteredIndex {
  pub fn is_unique(&self) -> bool {
    self.metadata.unique
  }

  pub fn is_eager(&self) -> bool {
    self.metadata.eager
  }

  pub fn extract_image(&self, properties: &PropertyBag) -> Option<Image> {
    self.generator.extract_image(properties)
  }

  pub fn create_update(&self, properties: &PropertyBag, before: Option<&Image>) -> MemberUpdate {
    self.generator.create_update(properties, before)
  }
}

impl fmt::Debug for RegisteredIndex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RegisteredIndex")
      .field("name", &self.name)
      .field("actor_type", &self.actor_type)
      .field("metadata", &self.metadata)
      .field("router", &self.router)
      .finish()
  }
}

/// Snapshot of the indexes declared on one actor type
#[derive(Debug, Clone)]
pub struct TypeCatalog {
  pub actor_type: ActorType,
  pub fault_tolerant: bool,
  pub storage: Option<String>,
  pub version: u64,
  pub indexes: BTreeMap<IndexName, Arc<RegisteredIndex>>,
}

impl TypeCatalog {
  pub fn get(&self, name: &IndexName) -> Option<&Arc<RegisteredIndex>> {
    self.indexes.get(name)
  }

  pub fn index_names(&self) -> BTreeSet<IndexName> {
    self.indexes.keys().cloned().collect()
  }

  pub fn has_unique_index(&self) -> bool {
    self.indexes.values().any(|index| index.is_unique())
  }

  fn persisted(&self) -> PersistedCatalog {
    PersistedCatalog {
      fault_tolerant: self.fault_tolerant,
      version: self.version,
      indexes: self
        .indexes
        .iter()
        .map(|(name, index)| (name.clone(), index.metadata.clone()))
        .collect(),
    }
  }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct PersistedCatalog {
  fault_tolerant: bool,
  version: u64,
  indexes: BTreeMap<IndexName, IndexMetaData>,
}

fn catalog_key(actor_type: &ActorType) -> String {
  format!("registry/{actor_type}")
}

// ============================================================================
// Registry
// ============================================================================

pub struct IndexRegistry {
  types: DashMap<ActorType, Arc<TypeCatalog>>,
  /// Global name → index map; names are unique across actor types
  indexes: DashMap<IndexName, Arc<RegisteredIndex>>,
  storage: StorageBindings,
  membership: Arc<dyn Membership>,
  bucket_config: BucketConfig,
  /// Serializes catalog swaps
  changes: Mutex<()>,
}

impl IndexRegistry {
  pub fn new(storage: StorageBindings, membership: Arc<dyn Membership>, bucket_config: BucketConfig) -> Self {
    Self {
      types: DashMap::new(),
      indexes: DashMap::new(),
      storage,
      membership,
      bucket_config,
      changes: Mutex::new(()),
    }
  }

  /// Register an actor type from the static table; its indexes start Available
  pub async fn register(&self, config: ActorTypeConfig) -> Result<Arc<TypeCatalog>> {
    let _guard = self.changes.lock().await;

    if self.types.contains_key(&config.actor_type) {
      return Err(RegistryError::DuplicateActorType(config.actor_type));
    }

    let mut seen = BTreeSet::new();
    for decl in &config.indexes {
      self.validate(&config.actor_type, config.fault_tolerant, decl)?;
      if !seen.insert(decl.name.clone()) {
        return Err(RegistryError::DuplicateIndex(decl.name.clone()));
      }
    }

    let mut indexes = BTreeMap::new();
    for decl in config.indexes {
      let index = self
        .build_index(&config.actor_type, decl, BucketStatus::Available)
        .await?;
      indexes.insert(index.name.clone(), index);
    }

    let mut catalog = TypeCatalog {
      actor_type: config.actor_type.clone(),
      fault_tolerant: config.fault_tolerant,
      storage: config.storage,
      version: 1,
      indexes,
    };
    catalog.version = self.reconcile_persisted(&catalog).await?;

    let catalog = Arc::new(catalog);
    for index in catalog.indexes.values() {
      self.indexes.insert(index.name.clone(), Arc::clone(index));
    }
    self.types.insert(catalog.actor_type.clone(), Arc::clone(&catalog));

    info!(
      actor_type = %catalog.actor_type,
      indexes = catalog.indexes.len(),
      fault_tolerant = catalog.fault_tolerant,
      version = catalog.version,
      "Registered actor type"
    );
    Ok(catalog)
  }

  /// Add an index to a registered type at runtime
  ///
  /// The new buckets start UnderConstruction; lookups fail until an index
  /// builder calls [`IndexRegistry::mark_index_available`].
  pub async fn add_index(&self, actor_type: &ActorType, decl: IndexDeclaration) -> Result<Arc<RegisteredIndex>> {
    let _guard = self.changes.lock().await;
    let current = self.current(actor_type)?;

    self.validate(actor_type, current.fault_tolerant, &decl)?;
    let index = self
      .build_index(actor_type, decl, BucketStatus::UnderConstruction)
      .await?;

    let mut next = (*current).clone();
    next.version += 1;
    next.indexes.insert(index.name.clone(), Arc::clone(&index));
    self.swap(next).await?;
    self.indexes.insert(index.name.clone(), Arc::clone(&index));

    info!(actor_type = %actor_type, index = %index.name, "Index added, under construction");
    Ok(index)
  }

  /// Dispose an index and drop it from its type's catalog
  pub async fn remove_index(&self, name: &IndexName) -> Result<()> {
    let _guard = self.changes.lock().await;
    let index = self
      .index(name)
      .ok_or_else(|| RegistryError::UnknownIndex(name.clone()))?;
    let current = self.current(&index.actor_type)?;

    index.router.dispose().await?;

    let mut next = (*current).clone();
    next.version += 1;
    next.indexes.remove(name);
    self.swap(next).await?;
    self.indexes.remove(name);

    info!(actor_type = %index.actor_type, index = %name, "Index removed");
    Ok(())
  }

  /// Index builder signal: backfill finished
  pub async fn mark_index_available(&self, name: &IndexName) -> Result<()> {
    let index = self
      .index(name)
      .ok_or_else(|| RegistryError::UnknownIndex(name.clone()))?;
    index.router.mark_available().await?;
    debug!(index = %name, "Index available");
    Ok(())
  }

  pub fn catalog(&self, actor_type: &ActorType) -> Option<Arc<TypeCatalog>> {
    self.types.get(actor_type).map(|c| Arc::clone(c.value()))
  }

  pub fn index(&self, name: &IndexName) -> Option<Arc<RegisteredIndex>> {
    self.indexes.get(name).map(|i| Arc::clone(i.value()))
  }

  pub fn actor_types(&self) -> Vec<ActorType> {
    let mut types: Vec<_> = self.types.iter().map(|entry| entry.key().clone()).collect();
    types.sort();
    types
  }

  /// Fail with `StaleIndexList` when `cached` no longer matches the registry
  pub fn ensure_current(&self, cached: &TypeCatalog) -> Result<()> {
    let current = self.current(&cached.actor_type)?;
    if current.version == cached.version {
      return Ok(());
    }
    let unchanged = current.indexes.len() == cached.indexes.len()
      && current
        .indexes
        .iter()
        .zip(cached.indexes.iter())
        .all(|((a, ai), (b, bi))| a == b && Arc::ptr_eq(ai, bi));
    if unchanged {
      Ok(())
    } else {
      Err(RegistryError::StaleIndexList {
        actor_type: cached.actor_type.clone(),
      })
    }
  }

  fn current(&self, actor_type: &ActorType) -> Result<Arc<TypeCatalog>> {
    self
      .catalog(actor_type)
      .ok_or_else(|| RegistryError::UnknownActorType(actor_type.clone()))
  }

  fn validate(&self, actor_type: &ActorType, fault_tolerant: bool, decl: &IndexDeclaration) -> Result<()> {
    if decl.metadata.eager && fault_tolerant {
      return Err(RegistryError::NotImplemented {
        actor_type: actor_type.clone(),
        index: decl.name.clone(),
      });
    }
    // Each host bucket only sees its own actors, so no bucket could
    // enforce a key owner across the cluster
    if decl.metadata.unique && decl.metadata.kind == IndexKind::PerHostPartition {
      return Err(RegistryError::UniquePerHost(decl.name.clone()));
    }
    if self.indexes.contains_key(&decl.name) {
      return Err(RegistryError::DuplicateIndex(decl.name.clone()));
    }
    if let IndexKind::PerKeyPartition { partitions: 0 } = decl.metadata.kind
      && self.bucket_config.default_partitions == 0
    {
      return Err(RegistryError::InvalidPartitions(decl.name.clone()));
    }
    Ok(())
  }

  async fn build_index(
    &self,
    actor_type: &ActorType,
    decl: IndexDeclaration,
    initial_status: BucketStatus,
  ) -> Result<Arc<RegisteredIndex>> {
    let mut metadata = decl.metadata;
    // Zero partitions means the configured default
    if let IndexKind::PerKeyPartition { partitions: 0 } = metadata.kind {
      metadata.kind = IndexKind::PerKeyPartition {
        partitions: self.bucket_config.default_partitions,
      };
    }

    let options = BucketOptions {
      unique: metadata.unique,
      coalesce_writes: self.bucket_config.coalesce_writes,
      initial_status,
      storage: self.storage.resolve(metadata.storage.as_deref())?,
    };
    let router = BucketRouter::load(&decl.name, &metadata, options, Arc::clone(&self.membership)).await?;
    debug!(actor_type = %actor_type, index = %decl.name, kind = ?metadata.kind, "Built index router");

    Ok(Arc::new(RegisteredIndex {
      name: decl.name,
      actor_type: actor_type.clone(),
      metadata,
      generator: decl.generator,
      router,
    }))
  }

  /// Compare against the persisted catalog and store the new one
  ///
  /// Returns the version the catalog should carry.
  async fn reconcile_persisted(&self, catalog: &TypeCatalog) -> Result<u64> {
    let storage = self.storage.default_provider()?;
    let key = catalog_key(&catalog.actor_type);
    let mut persisted = catalog.persisted();

    match storage.load_json::<PersistedCatalog>(&key).await? {
      Some(previous) if previous.indexes == persisted.indexes && previous.fault_tolerant == persisted.fault_tolerant => {
        return Ok(previous.version);
      }
      Some(previous) => {
        let before: BTreeSet<_> = previous.indexes.keys().collect();
        let after: BTreeSet<_> = persisted.indexes.keys().collect();
        warn!(
          actor_type = %catalog.actor_type,
          added = ?after.difference(&before).collect::<Vec<_>>(),
          removed = ?before.difference(&after).collect::<Vec<_>>(),
          "Declared indexes differ from persisted registry"
        );
        persisted.version = previous.version + 1;
      }
      None => {}
    }

    storage.save_json(&key, &persisted).await?;
    Ok(persisted.version)
  }

  async fn swap(&self, next: TypeCatalog) -> Result<()> {
    let storage = self.storage.default_provider()?;
    storage
      .save_json(&catalog_key(&next.actor_type), &next.persisted())
      .await?;
    self.types.insert(next.actor_type.clone(), Arc::new(next));
    Ok(())
  }
}

impl fmt::Debug for IndexRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IndexRegistry")
      .field("actor_types", &self.actor_types())
      .field("indexes", &self.indexes.len())
      .finish()
  }
}
