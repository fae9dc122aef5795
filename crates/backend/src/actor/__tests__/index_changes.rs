//! Adding and removing indexes while actors are active.

#[cfg(test)]
mod tests {
  use crate::{
    actor::__tests__::helpers::{TestContext, player, player_type},
    domain::{
      actor::{ActorType, IndexName},
      image::Image,
    },
    index::{IndexDeclaration, IndexError, PropertyGenerator, RegistryError},
  };

  /// Test: an active grain with a cached index list picks up a new index,
  /// which serves lookups once built.
  #[tokio::test]
  async fn test_added_index_reaches_active_grain() {
    let ctx = TestContext::new(1, vec![player_type(false)]).await;
    let (p1, p2) = (player("p1"), player("p2"));

    ctx.set(&p1, "Location", "Seattle").await.expect("set location");
    ctx.set(&p2, "Level", 3i64).await.expect("set level before index exists");

    ctx
      .runtime
      .add_index(
        &ActorType::new("Player"),
        IndexDeclaration::new("Level", PropertyGenerator::new("Level")).eager(),
      )
      .await
      .expect("add index");

    let level = IndexName::new("Level");
    let err = ctx
      .runtime
      .lookup(&level, &Image::from(5i64))
      .await
      .expect_err("index under construction");
    assert!(matches!(err, RegistryError::Index(IndexError::IndexNotAvailable { .. })));

    // Stale catalog refreshed transparently
    ctx.set(&p1, "Level", 5i64).await.expect("set level");

    ctx.runtime.build_index(&level).await.expect("build index");
    assert_eq!(ctx.lookup("Level", 5i64).await, vec![p1]);
    assert_eq!(ctx.lookup("Level", 3i64).await, vec![p2]);
  }

  /// Test: a removed index stops receiving updates without failing the
  /// actors that still cached it.
  #[tokio::test]
  async fn test_removed_index_is_dropped_by_active_grain() {
    let ctx = TestContext::new(1, vec![player_type(false)]).await;
    let p1 = player("p1");

    ctx.set(&p1, "Location", "Seattle").await.expect("set location");
    assert!(ctx.wait_for_lookup("Location", "Seattle", &[p1.clone()]).await);

    let location = IndexName::new("Location");
    ctx.runtime.remove_index(&location).await.expect("remove index");

    let workflow = ctx.set(&p1, "Location", "Portland").await.expect("set after removal");
    assert!(workflow.is_none(), "No index left to maintain");

    let err = ctx
      .runtime
      .lookup(&location, &Image::from("Portland"))
      .await
      .expect_err("index removed");
    assert!(matches!(err, RegistryError::UnknownIndex(_)));
  }
}
