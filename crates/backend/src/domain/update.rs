//! Before/after-image updates
//!
//! A [`MemberUpdate`] is the unit of work an index bucket consumes. It is
//! derived by diffing the image an actor had before a mutation against the
//! image it has afterwards, and the operation tag is always a function of
//! which images are present:
//!
//! ```text
//! before  after   operation
//! ------  -----   ---------
//! none    none    None
//! none    y       Insert
//! x       none    Delete
//! x       x       None
//! x       y       Update
//! ```

use serde::{Deserialize, Serialize};

use super::image::Image;

/// Kind of change a [`MemberUpdate`] applies to an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
  None,
  Insert,
  Update,
  Delete,
}

/// Immutable before/after image pair plus its derived operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UpdateImages", into = "UpdateImages")]
pub struct MemberUpdate {
  before: Option<Image>,
  after: Option<Image>,
  operation: OperationType,
}

/// Serialized form; the operation is re-derived on load so a persisted
/// update can never violate the tag invariant.
#[derive(Serialize, Deserialize)]
struct UpdateImages {
  before: Option<Image>,
  after: Option<Image>,
}

impl From<UpdateImages> for MemberUpdate {
  fn from(images: UpdateImages) -> Self {
    MemberUpdate::new(images.before, images.after)
  }
}

impl From<MemberUpdate> for UpdateImages {
  fn from(update: MemberUpdate) -> Self {
    UpdateImages {
      before: update.before,
      after: update.after,
    }
  }
}

impl MemberUpdate {
  /// Create an update by diffing two images
  pub fn new(before: Option<Image>, after: Option<Image>) -> Self {
    let operation = match (&before, &after) {
      (None, None) => OperationType::None,
      (None, Some(_)) => OperationType::Insert,
      (Some(_), None) => OperationType::Delete,
      (Some(b), Some(a)) if b == a => OperationType::None,
      (Some(_), Some(_)) => OperationType::Update,
    };
    // Equal images carry no information; drop them so None has neither.
    let (before, after) = match operation {
      OperationType::None => (None, None),
      _ => (before, after),
    };
    Self {
      before,
      after,
      operation,
    }
  }

  pub fn insert(after: Image) -> Self {
    Self::new(None, Some(after))
  }

  pub fn delete(before: Image) -> Self {
    Self::new(Some(before), None)
  }

  pub fn operation(&self) -> OperationType {
    self.operation
  }

  pub fn before_image(&self) -> Option<&Image> {
    self.before.as_ref()
  }

  pub fn after_image(&self) -> Option<&Image> {
    self.after.as_ref()
  }

  pub fn is_noop(&self) -> bool {
    self.operation == OperationType::None
  }

  /// Merge two sequential updates of the same actor on the same index
  ///
  /// The result spans from the first update's before-image to the second
  /// update's after-image.
  pub fn combine(first: &MemberUpdate, second: &MemberUpdate) -> MemberUpdate {
    // A no-op in front carries no before-image; the second one's is the
    // effective starting point.
    let before = if first.is_noop() {
      second.before.clone()
    } else {
      first.before.clone()
    };
    let after = if second.is_noop() {
      first.after.clone()
    } else {
      second.after.clone()
    };
    MemberUpdate::new(before, after)
  }

  /// The update that undoes this one: images swapped, Insert and Delete inverted
  pub fn reverse_tentative(&self) -> MemberUpdate {
    MemberUpdate::new(self.after.clone(), self.before.clone())
  }

  /// Split an update into its delete half and its insert half
  pub fn split(&self) -> (Option<MemberUpdate>, Option<MemberUpdate>) {
    (
      self.before.clone().map(MemberUpdate::delete),
      self.after.clone().map(MemberUpdate::insert),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn img(s: &str) -> Option<Image> {
    Some(Image::from(s))
  }

  #[test]
  fn test_operation_derivation() {
    assert_eq!(MemberUpdate::new(img("x"), img("x")).operation(), OperationType::None);
    assert_eq!(MemberUpdate::new(None, img("y")).operation(), OperationType::Insert);
    assert_eq!(MemberUpdate::new(img("x"), None).operation(), OperationType::Delete);
    assert_eq!(MemberUpdate::new(img("x"), img("y")).operation(), OperationType::Update);
    assert_eq!(MemberUpdate::new(None, None).operation(), OperationType::None);
  }

  #[test]
  fn test_tag_invariants() {
    let none = MemberUpdate::new(img("x"), img("x"));
    assert!(none.before_image().is_none() && none.after_image().is_none());

    let insert = MemberUpdate::new(None, img("y"));
    assert!(insert.before_image().is_none());

    let delete = MemberUpdate::new(img("x"), None);
    assert!(delete.after_image().is_none());
  }

  #[test]
  fn test_reverse_tentative_of_insert_is_delete() {
    let reversed = MemberUpdate::new(None, img("y")).reverse_tentative();
    assert_eq!(reversed.operation(), OperationType::Delete);
    assert_eq!(reversed.before_image(), Some(&Image::from("y")));
    assert!(reversed.after_image().is_none());
  }

  #[test]
  fn test_reverse_tentative_of_update_swaps_images() {
    let reversed = MemberUpdate::new(img("x"), img("y")).reverse_tentative();
    assert_eq!(reversed.operation(), OperationType::Update);
    assert_eq!(reversed.before_image(), Some(&Image::from("y")));
    assert_eq!(reversed.after_image(), Some(&Image::from("x")));
  }

  #[test]
  fn test_combine_spans_both_updates() {
    let first = MemberUpdate::new(img("a"), img("b"));
    let second = MemberUpdate::new(img("b"), img("c"));
    let combined = MemberUpdate::combine(&first, &second);
    assert_eq!(combined, MemberUpdate::new(img("a"), img("c")));

    let back = MemberUpdate::combine(&first, &MemberUpdate::new(img("b"), img("a")));
    assert!(back.is_noop());

    let insert_then_delete = MemberUpdate::combine(&MemberUpdate::insert("a".into()), &MemberUpdate::delete("a".into()));
    assert!(insert_then_delete.is_noop());
  }

  #[test]
  fn test_combine_with_noop() {
    let update = MemberUpdate::new(img("a"), img("b"));
    let noop = MemberUpdate::new(None, None);
    assert_eq!(MemberUpdate::combine(&noop, &update), update);
    assert_eq!(MemberUpdate::combine(&update, &noop), update);
  }

  #[test]
  fn test_split() {
    let (delete, insert) = MemberUpdate::new(img("a"), img("b")).split();
    assert_eq!(delete, Some(MemberUpdate::delete("a".into())));
    assert_eq!(insert, Some(MemberUpdate::insert("b".into())));
  }

  #[test]
  fn test_serde_rederives_operation() {
    let update = MemberUpdate::new(img("a"), img("b"));
    let json = serde_json::to_string(&update).unwrap();
    let back: MemberUpdate = serde_json::from_str(&json).unwrap();
    assert_eq!(back.operation(), OperationType::Update);
  }
}
