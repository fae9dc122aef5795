//! Runtime - process-scoped wiring of the indexing system
//!
//! One `Runtime` owns the cluster, the storage bindings, the index registry
//! and the two directories (grains and workflow queues). Everything that
//! would otherwise be a global cache hangs off it.
//!
//! # Architecture
//!
//! ```text
//! Runtime
//!   ├── Cluster (live nodes, one CancellationToken per node)
//!   ├── IndexRegistry ── TypeCatalog ── RegisteredIndex ── BucketRouter
//!   ├── GrainDirectory
//!   │     └── Grain (per actor, on a live node)
//!   └── WorkflowQueueDirectory
//!         └── WorkflowQueue + WorkflowQueueHandler (per type shard)
//! ```
//!
//! # Lifecycle
//!
//! 1. Create master `CancellationToken`
//! 2. Start the requested number of nodes
//! 3. Register the static actor type table (buckets load from storage)
//! 4. Serve grain requests; queues and handlers spawn lazily
//! 5. `shutdown()` cancels every node, stopping all hosted tasks

use std::sync::Arc;

use futures::future::join_all;
use grainidx_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  actor::{GrainDirectory, GrainError, GrainHandle},
  cluster::{Cluster, Membership},
  domain::{
    actor::{ActorRef, ActorType, IndexName, NodeAddress},
    image::Image,
  },
  index::{ActorTypeConfig, IndexDeclaration, IndexRegistry, RegisteredIndex, RegistryError},
  storage::StorageBindings,
  workflow::{WorkflowQueueDirectory, WorkflowQueueHandle},
};

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Runtime`]
///
/// ```ignore
/// let runtime = Runtime::builder()
///   .nodes(3)
///   .actor_type(ActorTypeConfig::new("Player").index(IndexDeclaration::new("Location", ..)))
///   .build()
///   .await?;
/// ```
pub struct RuntimeBuilder {
  config: Config,
  storage: Option<StorageBindings>,
  nodes: usize,
  actor_types: Vec<ActorTypeConfig>,
}

impl RuntimeBuilder {
  fn new() -> Self {
    Self {
      config: Config::default(),
      storage: None,
      nodes: 1,
      actor_types: Vec::new(),
    }
  }

  pub fn config(mut self, config: Config) -> Self {
    self.config = config;
    self
  }

  /// Storage bindings; defaults to what `config.storage` describes
  pub fn storage(mut self, storage: StorageBindings) -> Self {
    self.storage = Some(storage);
    self
  }

  pub fn nodes(mut self, count: usize) -> Self {
    self.nodes = count.max(1);
    self
  }

  pub fn actor_type(mut self, config: ActorTypeConfig) -> Self {
    self.actor_types.push(config);
    self
  }

  pub async fn build(self) -> Result<Arc<Runtime>, RegistryError> {
    let cancel = CancellationToken::new();
    let cluster = Arc::new(Cluster::new(cancel.clone()));
    for _ in 0..self.nodes {
      cluster.add_node();
    }

    let storage = self
      .storage
      .unwrap_or_else(|| StorageBindings::from_config(&self.config.storage));
    let registry = IndexRegistry::new(
      storage.clone(),
      Arc::clone(&cluster) as Arc<dyn Membership>,
      self.config.bucket.clone(),
    );
    for actor_type in self.actor_types {
      registry.register(actor_type).await?;
    }

    let shard_count = self.config.queue.effective_shard_count();
    info!(
      nodes = self.nodes,
      actor_types = registry.actor_types().len(),
      queue_shards = shard_count,
      "Runtime started"
    );

    Ok(Arc::new(Runtime {
      config: Arc::new(self.config),
      storage,
      cluster,
      registry,
      grains: GrainDirectory::new(),
      queues: WorkflowQueueDirectory::new(shard_count),
      cancel,
    }))
  }
}

// ============================================================================
// Runtime
// ============================================================================

pub struct Runtime {
  config: Arc<Config>,
  storage: StorageBindings,
  cluster: Arc<Cluster>,
  registry: IndexRegistry,
  grains: GrainDirectory,
  queues: WorkflowQueueDirectory,
  cancel: CancellationToken,
}

impl Runtime {
  pub fn builder() -> RuntimeBuilder {
    RuntimeBuilder::new()
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn storage(&self) -> &StorageBindings {
    &self.storage
  }

  pub fn cluster(&self) -> &Cluster {
    &self.cluster
  }

  pub fn registry(&self) -> &IndexRegistry {
    &self.registry
  }

  pub fn grains(&self) -> &GrainDirectory {
    &self.grains
  }

  pub fn queues(&self) -> &WorkflowQueueDirectory {
    &self.queues
  }

  /// A queue handle is usable while its task runs and its node is alive
  pub fn is_queue_live(&self, handle: &WorkflowQueueHandle) -> bool {
    handle.is_alive() && self.cluster.is_alive(handle.node())
  }

  pub fn is_shutdown(&self) -> bool {
    self.cancel.is_cancelled()
  }

  // --------------------------------------------------------------------------
  // Grains
  // --------------------------------------------------------------------------

  /// Handle of `actor`, activating it (and running recovery) if needed
  pub async fn grain(self: &Arc<Self>, actor: &ActorRef) -> Result<GrainHandle, GrainError> {
    self.grains.get_or_activate(self, actor).await
  }

  pub async fn deactivate(&self, actor: &ActorRef) -> bool {
    self.grains.deactivate(actor).await
  }

  // --------------------------------------------------------------------------
  // Indexes
  // --------------------------------------------------------------------------

  pub fn index(&self, name: &IndexName) -> Result<Arc<RegisteredIndex>, RegistryError> {
    self
      .registry
      .index(name)
      .ok_or_else(|| RegistryError::UnknownIndex(name.clone()))
  }

  /// All actors currently holding `key` in index `name`
  pub async fn lookup(&self, name: &IndexName, key: &Image) -> Result<Vec<ActorRef>, RegistryError> {
    Ok(self.index(name)?.router.lookup(key).await?)
  }

  /// The single owner of `key` in a unique index
  pub async fn lookup_unique(&self, name: &IndexName, key: &Image) -> Result<ActorRef, RegistryError> {
    Ok(self.index(name)?.router.lookup_unique(key).await?)
  }

  pub async fn add_index(
    &self,
    actor_type: &ActorType,
    decl: IndexDeclaration,
  ) -> Result<Arc<RegisteredIndex>, RegistryError> {
    self.registry.add_index(actor_type, decl).await
  }

  pub async fn remove_index(&self, name: &IndexName) -> Result<(), RegistryError> {
    self.registry.remove_index(name).await
  }

  pub async fn mark_index_available(&self, name: &IndexName) -> Result<(), RegistryError> {
    self.registry.mark_index_available(name).await
  }

  /// Minimal index builder: backfill from the live activations of the
  /// index's actor type, then mark the index available
  ///
  /// Returns the number of actors backfilled.
  pub async fn build_index(&self, name: &IndexName) -> Result<usize, RegistryError> {
    let index = self.index(name)?;
    let actors: Vec<_> = self
      .grains
      .list(self)
      .into_iter()
      .filter(|actor| actor.actor_type == index.actor_type)
      .filter_map(|actor| self.grains.get_active(self, &actor))
      .collect();

    let mut backfilled = 0;
    for handle in actors {
      let properties = match handle.get_properties().await {
        Ok(properties) => properties,
        Err(e) => {
          debug!(actor = %handle.reference(), error = %e, "Skipping stopped grain during backfill");
          continue;
        }
      };
      let Some(key) = index.extract_image(&properties) else {
        continue;
      };
      if index.router.backfill(&key, handle.reference(), handle.node()).await? {
        backfilled += 1;
      }
    }

    self.registry.mark_index_available(name).await?;
    info!(index = %name, backfilled, "Index built");
    Ok(backfilled)
  }

  // --------------------------------------------------------------------------
  // Cluster
  // --------------------------------------------------------------------------

  pub fn add_node(&self) -> NodeAddress {
    let node = self.cluster.add_node();
    info!(node = %node, "Node joined");
    node
  }

  /// Fail a node: every grain and queue hosted there stops, and the queues
  /// are reincarnated on surviving nodes
  pub async fn kill_node(self: &Arc<Self>, node: NodeAddress) -> bool {
    if !self.cluster.kill_node(node) {
      return false;
    }
    warn!(node = %node, "Node failed");
    self.queues.reincarnate_hosted_on(self, node).await;
    true
  }

  pub fn live_nodes(&self) -> Vec<NodeAddress> {
    self.cluster.live_nodes()
  }

  // --------------------------------------------------------------------------
  // Workflows
  // --------------------------------------------------------------------------

  /// Records still pending or in flight across all live queues
  pub async fn pending_workflows(&self) -> usize {
    let stats = join_all(self.queues.live(self).into_iter().map(|queue| async move { queue.stats().await })).await;
    stats.into_iter().filter_map(Result::ok).map(|s| s.total()).sum()
  }

  pub fn shutdown(&self) {
    info!("Runtime shutting down");
    self.cluster.shutdown();
    self.cancel.cancel();
  }
}

impl std::fmt::Debug for Runtime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Runtime")
      .field("cluster", &self.cluster)
      .field("registry", &self.registry)
      .field("storage", &self.storage)
      .finish_non_exhaustive()
  }
}
