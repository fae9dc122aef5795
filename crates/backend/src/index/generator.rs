//! Update generators: project actor properties into index images.

use std::fmt;

use crate::domain::{
  image::{Image, PropertyBag},
  update::MemberUpdate,
};

/// Extracts the index-relevant image from actor state
///
/// Implementations must be deterministic and side-effect free: the same
/// generator runs on activation to seed before-images and after every
/// mutation to produce the after-image.
pub trait IndexUpdateGenerator: Send + Sync {
  fn extract_image(&self, properties: &PropertyBag) -> Option<Image>;

  fn create_update(&self, properties: &PropertyBag, before: Option<&Image>) -> MemberUpdate {
    MemberUpdate::new(before.cloned(), self.extract_image(properties))
  }
}

/// Indexes a single named property
#[derive(Debug, Clone)]
pub struct PropertyGenerator {
  property: String,
}

impl PropertyGenerator {
  pub fn new(property: impl Into<String>) -> Self {
    Self {
      property: property.into(),
    }
  }
}

impl IndexUpdateGenerator for PropertyGenerator {
  fn extract_image(&self, properties: &PropertyBag) -> Option<Image> {
    properties.get(&self.property).cloned()
  }
}

/// Indexes several properties as one tuple image
///
/// The image is absent unless every property is present.
#[derive(Debug, Clone)]
pub struct CompositeGenerator {
  properties: Vec<String>,
}

impl CompositeGenerator {
  pub fn new<I, S>(properties: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      properties: properties.into_iter().map(Into::into).collect(),
    }
  }
}

impl IndexUpdateGenerator for CompositeGenerator {
  fn extract_image(&self, properties: &PropertyBag) -> Option<Image> {
    let parts = self
      .properties
      .iter()
      .map(|name| properties.get(name).cloned())
      .collect::<Option<Vec<_>>>()?;
    Some(Image::Tuple(parts))
  }
}

/// Arbitrary projection, e.g. a normalized (lower-cased) email
pub struct FnGenerator<F> {
  f: F,
}

impl<F> FnGenerator<F>
where
  F: Fn(&PropertyBag) -> Option<Image> + Send + Sync,
{
  pub fn new(f: F) -> Self {
    Self { f }
  }
}

impl<F> IndexUpdateGenerator for FnGenerator<F>
where
  F: Fn(&PropertyBag) -> Option<Image> + Send + Sync,
{
  fn extract_image(&self, properties: &PropertyBag) -> Option<Image> {
    (self.f)(properties)
  }
}

impl<F> fmt::Debug for FnGenerator<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("FnGenerator")
  }
}
