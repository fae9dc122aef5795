//! Index images and actor property bags.
//!
//! An image is the projection of an actor's state that one index cares
//! about. Images are compared for equality (to derive update tags), hashed
//! (to pick partitions) and ordered (so persisted buckets are stable).

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// A projected index value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Image {
  Bool(bool),
  Int(i64),
  Str(String),
  /// Composite image for indexes over several properties
  Tuple(Vec<Image>),
}

impl Image {
  /// Canonical byte encoding used for stable hashing
  pub fn canonical_bytes(&self) -> Vec<u8> {
    let mut out = Vec::new();
    self.encode_into(&mut out);
    out
  }

  fn encode_into(&self, out: &mut Vec<u8>) {
    match self {
      Image::Bool(b) => {
        out.push(0);
        out.push(u8::from(*b));
      }
      Image::Int(i) => {
        out.push(1);
        out.extend_from_slice(&i.to_be_bytes());
      }
      Image::Str(s) => {
        out.push(2);
        out.extend_from_slice(&(s.len() as u64).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
      }
      Image::Tuple(items) => {
        out.push(3);
        out.extend_from_slice(&(items.len() as u64).to_be_bytes());
        for item in items {
          item.encode_into(out);
        }
      }
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Image::Str(s) => Some(s),
      _ => None,
    }
  }
}

impl fmt::Display for Image {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Image::Bool(b) => write!(f, "{b}"),
      Image::Int(i) => write!(f, "{i}"),
      Image::Str(s) => write!(f, "{s:?}"),
      Image::Tuple(items) => {
        f.write_str("(")?;
        for (i, item) in items.iter().enumerate() {
          if i > 0 {
            f.write_str(", ")?;
          }
          write!(f, "{item}")?;
        }
        f.write_str(")")
      }
    }
  }
}

impl From<&str> for Image {
  fn from(value: &str) -> Self {
    Image::Str(value.to_string())
  }
}

impl From<String> for Image {
  fn from(value: String) -> Self {
    Image::Str(value)
  }
}

impl From<i64> for Image {
  fn from(value: i64) -> Self {
    Image::Int(value)
  }
}

impl From<bool> for Image {
  fn from(value: bool) -> Self {
    Image::Bool(value)
  }
}

/// A set of property assignments; `None` clears the property
pub type PropertyPatch = BTreeMap<String, Option<Image>>;

/// The indexable state of an actor: named property values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyBag(BTreeMap<String, Image>);

impl PropertyBag {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style setter
  pub fn with(mut self, name: impl Into<String>, value: impl Into<Image>) -> Self {
    self.set(name, value);
    self
  }

  pub fn get(&self, name: &str) -> Option<&Image> {
    self.0.get(name)
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<Image>) {
    self.0.insert(name.into(), value.into());
  }

  pub fn remove(&mut self, name: &str) -> Option<Image> {
    self.0.remove(name)
  }

  /// Apply a patch, returning whether anything changed
  pub fn apply(&mut self, patch: &PropertyPatch) -> bool {
    let mut changed = false;
    for (name, value) in patch {
      match value {
        Some(v) => {
          if self.0.get(name) != Some(v) {
            self.0.insert(name.clone(), v.clone());
            changed = true;
          }
        }
        None => changed |= self.0.remove(name).is_some(),
      }
    }
    changed
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Image)> {
    self.0.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}
