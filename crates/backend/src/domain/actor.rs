//! Actor, node and index identities.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

use super::stable_hash;

/// Name of an actor type (the "interface" an index is declared on)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorType(String);

impl ActorType {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ActorType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ActorType {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

/// Primary key of an actor within its type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ActorId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ActorId {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

impl From<String> for ActorId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

/// Location-transparent reference to one actor
///
/// This is what index buckets store: it names the actor, never the
/// activation, so it stays valid across migration and reactivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorRef {
  pub actor_type: ActorType,
  pub id: ActorId,
}

impl ActorRef {
  pub fn new(actor_type: impl Into<ActorType>, id: impl Into<ActorId>) -> Self {
    Self {
      actor_type: actor_type.into(),
      id: id.into(),
    }
  }

  /// Hash of the actor id only, used to pick the actor's workflow queue shard
  pub fn id_hash(&self) -> u64 {
    stable_hash(self.id.as_str().as_bytes())
  }

  /// Hash of the full reference, used for node placement
  pub fn placement_hash(&self) -> u64 {
    stable_hash(self.to_string().as_bytes())
  }

  /// Durable state key for this actor
  pub fn storage_key(&self) -> String {
    format!("grain/{}/{}", self.actor_type, self.id)
  }
}

impl fmt::Display for ActorRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.actor_type, self.id)
  }
}

/// Address of a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(u32);

impl NodeAddress {
  pub fn new(n: u32) -> Self {
    Self(n)
  }

  pub fn as_u32(&self) -> u32 {
    self.0
  }
}

impl fmt::Display for NodeAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "node-{}", self.0)
  }
}

/// Name of a declared index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexName(String);

impl IndexName {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for IndexName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for IndexName {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

impl Borrow<str> for IndexName {
  fn borrow(&self) -> &str {
    &self.0
  }
}
