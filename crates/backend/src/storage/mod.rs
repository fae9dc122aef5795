//! Durable state storage
//!
//! Every durable unit in the system (actors, index buckets, workflow
//! queues, the index registry) persists through a [`StorageProvider`]
//! chosen by a named binding. Two bindings ship with the crate:
//!
//! - `memory`: process-lifetime map, survives node failure but not restart
//! - `file`: one JSON file per key under a data directory, named by the
//!   SHA-256 of the key

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Unknown storage binding: {0}")]
  UnknownBinding(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Per-key durable state load/save
#[async_trait]
pub trait StorageProvider: Send + Sync {
  /// Short provider name for logs
  fn name(&self) -> &str;

  async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

  async fn save(&self, key: &str, value: &[u8]) -> Result<()>;

  async fn remove(&self, key: &str) -> Result<()>;
}

impl dyn StorageProvider {
  /// Load and deserialize a JSON value
  pub async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    match self.load(key).await? {
      Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
      None => Ok(None),
    }
  }

  /// Serialize and save a JSON value
  pub async fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    self.save(key, &bytes).await
  }
}

// ============================================================================
// In-memory binding
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
  fn name(&self) -> &str {
    "memory"
  }

  async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.entries.get(key).map(|v| v.value().clone()))
  }

  async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
    trace!(key, bytes = value.len(), "memory storage save");
    self.entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self.entries.remove(key);
    Ok(())
  }
}

// ============================================================================
// File binding
// ============================================================================

/// Content-addressed file storage: `{root}/{sha256(key)}.json`
#[derive(Debug, Clone)]
pub struct FileStorage {
  root: PathBuf,
}

impl FileStorage {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn path_for(&self, key: &str) -> PathBuf {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(key.as_bytes());
    self.root.join(format!("{}.json", hex::encode(digest)))
  }
}

#[async_trait]
impl StorageProvider for FileStorage {
  fn name(&self) -> &str {
    "file"
  }

  async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(self.path_for(key)).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(&self.root).await?;
    let path = self.path_for(key);
    // Write-then-rename so a crash never leaves a torn file behind
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, value).await?;
    tokio::fs::rename(&tmp, &path).await?;
    trace!(key, path = %path.display(), "file storage save");
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    match tokio::fs::remove_file(self.path_for(key)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }
}

// ============================================================================
// Bindings
// ============================================================================

/// Named storage providers, resolved per actor type and per index
#[derive(Clone)]
pub struct StorageBindings {
  providers: HashMap<String, Arc<dyn StorageProvider>>,
  default_binding: String,
}

impl StorageBindings {
  /// Bindings with only the `memory` provider
  pub fn in_memory() -> Self {
    let mut providers: HashMap<String, Arc<dyn StorageProvider>> = HashMap::new();
    providers.insert("memory".to_string(), Arc::new(MemoryStorage::new()));
    Self {
      providers,
      default_binding: "memory".to_string(),
    }
  }

  /// Bindings built from config: `memory` always, `file` under the data dir
  pub fn from_config(config: &grainidx_core::StorageConfig) -> Self {
    let mut bindings = Self::in_memory();
    let data_dir = config.resolved_data_dir();
    debug!(data_dir = %data_dir.display(), "Registering file storage binding");
    bindings.register("file", Arc::new(FileStorage::new(data_dir)));
    bindings.default_binding = config.default_binding.clone();
    bindings
  }

  pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn StorageProvider>) {
    self.providers.insert(name.into(), provider);
  }

  pub fn set_default(&mut self, name: impl Into<String>) {
    self.default_binding = name.into();
  }

  /// Resolve a binding by name, or the default binding when `None`
  pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn StorageProvider>> {
    let name = name.unwrap_or(&self.default_binding);
    self
      .providers
      .get(name)
      .cloned()
      .ok_or_else(|| StorageError::UnknownBinding(name.to_string()))
  }

  pub fn default_provider(&self) -> Result<Arc<dyn StorageProvider>> {
    self.resolve(None)
  }
}

impl std::fmt::Debug for StorageBindings {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut names: Vec<_> = self.providers.keys().collect();
    names.sort();
    f.debug_struct("StorageBindings")
      .field("providers", &names)
      .field("default_binding", &self.default_binding)
      .finish()
  }
}
