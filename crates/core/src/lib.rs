//! Shared configuration for the grain indexing workspace.

pub mod config;

pub use config::{ActorConfig, BucketConfig, Config, ConfigError, LoggingConfig, QueueConfig, StorageConfig};
