//! Domain types - core indexing entities
//!
//! Identity types for actors and nodes, the index image value model, and
//! the before/after-image update that flows from actors to index buckets.
//! These types are independent of storage and of the runtime hosting them.

pub mod actor;
pub mod image;
pub mod update;

pub use grainidx_core::config;

/// Stable 64-bit hash used for shard selection and placement.
///
/// Unlike `DefaultHasher`, the result is identical across processes and
/// builds, which every node relies on to agree on shard ownership.
pub fn stable_hash(bytes: &[u8]) -> u64 {
  use sha2::{Digest, Sha256};

  let digest = Sha256::digest(bytes);
  let mut prefix = [0u8; 8];
  prefix.copy_from_slice(&digest[..8]);
  u64::from_be_bytes(prefix)
}
