//! Test helpers for grain indexing scenarios.
//!
//! Provides `TestContext`, which builds an in-memory [`Runtime`] with a
//! small cluster and fast retry settings, plus polling helpers for the
//! eventually consistent lazy paths.

use std::{future::Future, sync::Arc, time::Duration};

use crate::{
  actor::{GrainError, GrainHandle},
  domain::{
    actor::{ActorRef, IndexName, NodeAddress},
    config::Config,
    image::Image,
  },
  index::{ActorTypeConfig, IndexDeclaration, PropertyGenerator},
  runtime::Runtime,
  storage::{StorageBindings, StorageProvider},
  workflow::WorkflowId,
};

/// How long lazy index maintenance gets to settle
pub const SETTLE: Duration = Duration::from_secs(5);

/// Config with a single queue shard and short backoff
pub fn test_config() -> Config {
  let mut config = Config::default();
  config.queue.shard_count = 1;
  config.queue.max_batch_size = 16;
  config.queue.retry_backoff_ms = 10;
  config
}

pub fn player(id: &str) -> ActorRef {
  ActorRef::new("Player", id)
}

/// `Player` type with a lazy, non-unique `Location` index
pub fn player_type(fault_tolerant: bool) -> ActorTypeConfig {
  let location = IndexDeclaration::new("Location", PropertyGenerator::new("Location"));
  let config = ActorTypeConfig::new("Player").index(location);
  if fault_tolerant { config.fault_tolerant() } else { config }
}

/// Fault-tolerant `Player` type whose `Location` index is partitioned per host
pub fn per_host_player_type() -> ActorTypeConfig {
  ActorTypeConfig::new("Player")
    .fault_tolerant()
    .index(IndexDeclaration::new("Location", PropertyGenerator::new("Location")).per_host())
}

/// Test context owning a runtime backed by memory storage.
pub struct TestContext {
  pub runtime: Arc<Runtime>,
}

impl TestContext {
  pub async fn new(nodes: usize, actor_types: Vec<ActorTypeConfig>) -> Self {
    Self::with_config(test_config(), nodes, actor_types).await
  }

  pub async fn with_config(config: Config, nodes: usize, actor_types: Vec<ActorTypeConfig>) -> Self {
    let mut builder = Runtime::builder()
      .config(config)
      .storage(StorageBindings::in_memory())
      .nodes(nodes);
    for actor_type in actor_types {
      builder = builder.actor_type(actor_type);
    }
    let runtime = builder.build().await.expect("build runtime");
    Self { runtime }
  }

  /// The default storage binding, for seeding and inspecting durable state
  pub fn storage(&self) -> Arc<dyn StorageProvider> {
    self.runtime.storage().default_provider().expect("default storage binding")
  }

  pub async fn grain(&self, actor: &ActorRef) -> GrainHandle {
    self.runtime.grain(actor).await.expect("activate grain")
  }

  pub async fn set(&self, actor: &ActorRef, name: &str, value: impl Into<Image>) -> Result<Option<WorkflowId>, GrainError> {
    self.grain(actor).await.set_property(name, value).await
  }

  /// Sorted lookup result; empty when the index cannot serve lookups
  pub async fn lookup(&self, index: &str, key: impl Into<Image>) -> Vec<ActorRef> {
    let mut found = self
      .runtime
      .lookup(&IndexName::new(index), &key.into())
      .await
      .unwrap_or_default();
    found.sort();
    found
  }

  /// Wait until `index[key]` holds exactly `expected`
  pub async fn wait_for_lookup(&self, index: &str, key: &str, expected: &[ActorRef]) -> bool {
    let mut expected = expected.to_vec();
    expected.sort();
    wait_for(SETTLE, || async { self.lookup(index, key).await == expected }).await
  }

  /// Actors holding `key` in the bucket each live node keeps for `index`
  pub async fn lookup_per_host(&self, index: &str, key: &str) -> Vec<(NodeAddress, Vec<ActorRef>)> {
    let Ok(index) = self.runtime.index(&IndexName::new(index)) else {
      return Vec::new();
    };
    let mut hosts = Vec::new();
    for node in self.runtime.live_nodes() {
      let mut found = index.router.lookup_on_host(node, &Image::from(key)).await.unwrap_or_default();
      found.sort();
      hosts.push((node, found));
    }
    hosts
  }

  /// Wait until every live workflow queue is empty
  pub async fn wait_until_drained(&self) -> bool {
    wait_for(SETTLE, || async { self.runtime.pending_workflows().await == 0 }).await
  }
}

impl Drop for TestContext {
  fn drop(&mut self) {
    self.runtime.shutdown();
  }
}

/// Wait for a condition to become true, with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let start = std::time::Instant::now();
  let poll_interval = Duration::from_millis(20);

  while start.elapsed() < timeout {
    if check().await {
      return true;
    }
    tokio::time::sleep(poll_interval).await;
  }

  false
}
