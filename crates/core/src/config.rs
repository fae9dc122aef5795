//! Configuration system for grainidx with per-project overrides.
//!
//! Config priority: project-relative (.grainidx/config.toml) > user (~/.config/grainidx/config.toml) > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Invalid config: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("Failed to render config: {0}")]
  Render(#[from] toml::ser::Error),
}

// ============================================================================
// Workflow Queue Configuration
// ============================================================================

/// Workflow queue and queue handler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Number of queue shards per actor type (0 = one per hardware thread)
  pub shard_count: usize,

  /// Maximum records handed to a queue handler per batch (default: 128)
  pub max_batch_size: usize,

  /// Seconds an empty, idle queue stays activated before it deactivates (default: 600)
  pub idle_timeout_secs: u64,

  /// Milliseconds the handler waits before retrying records whose actors
  /// could not be reached (default: 100)
  pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      shard_count: 0,
      max_batch_size: 128,
      idle_timeout_secs: 600,
      retry_backoff_ms: 100,
    }
  }
}

impl QueueConfig {
  /// Resolve the configured shard count, falling back to the hardware thread count
  pub fn effective_shard_count(&self) -> usize {
    if self.shard_count == 0 {
      num_cpus::get().max(1)
    } else {
      self.shard_count
    }
  }

  pub fn idle_timeout(&self) -> Duration {
    Duration::from_secs(self.idle_timeout_secs)
  }

  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }
}

// ============================================================================
// Bucket Configuration
// ============================================================================

/// Index bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
  /// Coalesce concurrent durable writes into one (group commit) (default: true)
  pub coalesce_writes: bool,

  /// Default number of partitions for per-key partitioned indexes (default: 8)
  pub default_partitions: usize,
}

impl Default for BucketConfig {
  fn default() -> Self {
    Self {
      coalesce_writes: true,
      default_partitions: 8,
    }
  }
}

// ============================================================================
// Actor Configuration
// ============================================================================

/// Indexable actor behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
  /// How many times a mutation refreshes a stale index list before giving up (default: 3)
  pub max_stale_retries: u32,

  /// Mailbox capacity of each activated actor (default: 64)
  pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
  fn default() -> Self {
    Self {
      max_stale_retries: 3,
      mailbox_capacity: 64,
    }
  }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Durable storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Binding used when an actor type or index does not name one (default: "memory")
  pub default_binding: String,

  /// Root directory for the "file" binding (default: <data dir>/grainidx)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      default_binding: "memory".to_string(),
      data_dir: None,
    }
  }
}

impl StorageConfig {
  /// Directory used by the file storage binding
  pub fn resolved_data_dir(&self) -> PathBuf {
    if let Some(ref dir) = self.data_dir {
      return dir.clone();
    }
    if let Ok(path) = std::env::var("GRAINIDX_DATA_DIR") {
      return PathBuf::from(path);
    }
    dirs::data_local_dir()
      .unwrap_or_else(|| PathBuf::from("."))
      .join("grainidx")
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: error, warn, info, debug, trace (default: info)
  pub log_level: String,

  /// Optional log file; console logging when unset
  #[serde(skip_serializing_if = "Option::is_none")]
  pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      log_level: "info".to_string(),
      log_file: None,
    }
  }
}

// ============================================================================
// Root Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub queue: QueueConfig,

  #[serde(default)]
  pub bucket: BucketConfig,

  #[serde(default)]
  pub actor: ActorConfig,

  #[serde(default)]
  pub storage: StorageConfig,

  #[serde(default)]
  pub logging: LoggingConfig,
}

impl Config {
  /// Load config for a project, with fallback to user config
  pub fn load_for_project(project_path: &Path) -> Self {
    let project_config = Self::project_config_path(project_path);
    if project_config.exists()
      && let Ok(content) = std::fs::read_to_string(&project_config)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    if let Some(user_config_path) = Self::user_config_path()
      && user_config_path.exists()
      && let Ok(content) = std::fs::read_to_string(&user_config_path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    Self::default()
  }

  /// Load an explicit config file, surfacing parse errors
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GRAINIDX_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("grainidx").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("grainidx").join("config.toml"))
  }

  /// Get the project-relative config path
  pub fn project_config_path(project_path: &Path) -> PathBuf {
    project_path.join(".grainidx").join("config.toml")
  }

  /// Render the config as TOML
  pub fn to_toml(&self) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(self)?)
  }

  /// Generate a commented default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# grainidx configuration
# Place in .grainidx/config.toml (project) or ~/.config/grainidx/config.toml (user)

[queue]
# Queue shards per actor type (0 = one per hardware thread)
shard_count = {shard_count}
# Records handed to the queue handler per batch
max_batch_size = {max_batch_size}
# Seconds an idle, empty queue stays activated
idle_timeout_secs = {idle_timeout_secs}
# Backoff before retrying records whose actor was unreachable
retry_backoff_ms = {retry_backoff_ms}

[bucket]
# Group-commit concurrent bucket writes
coalesce_writes = {coalesce_writes}
# Partitions for per-key partitioned indexes
default_partitions = {default_partitions}

[actor]
# Stale index list refresh attempts per mutation
max_stale_retries = {max_stale_retries}
mailbox_capacity = {mailbox_capacity}

[storage]
# Binding used when none is named: memory or file
default_binding = "{default_binding}"
# data_dir = "/var/lib/grainidx"

[logging]
# error, warn, info, debug, trace (RUST_LOG overrides)
log_level = "{log_level}"
# log_file = "/var/log/grainidx.log"
"#,
      shard_count = defaults.queue.shard_count,
      max_batch_size = defaults.queue.max_batch_size,
      idle_timeout_secs = defaults.queue.idle_timeout_secs,
      retry_backoff_ms = defaults.queue.retry_backoff_ms,
      coalesce_writes = defaults.bucket.coalesce_writes,
      default_partitions = defaults.bucket.default_partitions,
      max_stale_retries = defaults.actor.max_stale_retries,
      mailbox_capacity = defaults.actor.mailbox_capacity,
      default_binding = defaults.storage.default_binding,
      log_level = defaults.logging.log_level,
    )
  }
}
