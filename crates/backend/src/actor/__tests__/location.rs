//! Per-host lazy index scenarios.
//!
//! Players spread over the cluster; `Location` is maintained through the
//! workflow queue into per-host buckets.

#[cfg(test)]
mod tests {
  use crate::{
    actor::__tests__::helpers::{SETTLE, TestContext, per_host_player_type as per_host_players, player, wait_for},
    cluster::Membership,
    domain::image::Image,
  };

  /// Test: all players in Seattle are found, deactivation does not touch
  /// the index, and a move is reflected after the queue drains.
  #[tokio::test]
  async fn test_per_host_location_follows_moves() {
    let ctx = TestContext::new(3, vec![per_host_players()]).await;
    let (p1, p2, p3) = (player("p1"), player("p2"), player("p3"));

    for p in [&p1, &p2, &p3] {
      let workflow = ctx.set(p, "Location", "Seattle").await.expect("set location");
      assert!(workflow.is_some(), "Lazy index update should produce a workflow");
    }

    assert!(
      ctx
        .wait_for_lookup("Location", "Seattle", &[p1.clone(), p2.clone(), p3.clone()])
        .await,
      "All three players should be indexed in Seattle"
    );

    // Deactivation is not a state change
    assert!(ctx.runtime.deactivate(&p2).await);
    assert_eq!(ctx.lookup("Location", "Seattle").await, vec![p1.clone(), p2.clone(), p3.clone()]);

    // Reactivates P2 from its persisted state
    ctx.set(&p2, "Location", "Portland").await.expect("move p2");

    assert!(ctx.wait_for_lookup("Location", "Seattle", &[p1.clone(), p3.clone()]).await);
    assert!(ctx.wait_for_lookup("Location", "Portland", &[p2.clone()]).await);
    assert!(ctx.wait_until_drained().await);

    // Every confirmed workflow is trimmed from the active set
    let handle = ctx.grain(&p2).await;
    let trimmed = wait_for(SETTLE, || async {
      matches!(handle.get_active_workflows().await, Ok(Some(active)) if active.is_empty())
    })
    .await;
    assert!(trimmed, "P2 should end with no active workflows");
  }

  /// Test: P1 and P2 in Seattle, P3 in San Francisco. P2 deactivates and
  /// reactivates without changing anything, and Seattle still holds
  /// exactly P1 and P2.
  #[tokio::test]
  async fn test_reactivation_without_mutation_keeps_entries() {
    let ctx = TestContext::new(3, vec![per_host_players()]).await;
    let (p1, p2, p3) = (player("p1"), player("p2"), player("p3"));

    ctx.set(&p1, "Location", "Seattle").await.expect("set p1");
    ctx.set(&p2, "Location", "Seattle").await.expect("set p2");
    ctx.set(&p3, "Location", "San Francisco").await.expect("set p3");

    assert!(ctx.wait_for_lookup("Location", "Seattle", &[p1.clone(), p2.clone()]).await);
    assert!(ctx.wait_for_lookup("Location", "San Francisco", &[p3.clone()]).await);

    assert!(ctx.runtime.deactivate(&p2).await);
    let props = ctx.grain(&p2).await.get_properties().await.expect("properties");
    assert_eq!(props.get("Location"), Some(&Image::from("Seattle")));
    assert!(ctx.wait_until_drained().await);

    assert_eq!(ctx.lookup("Location", "Seattle").await, vec![p1, p2]);
    assert_eq!(ctx.lookup("Location", "San Francisco").await, vec![p3]);
  }

  /// Test: a node joins, a player whose placement changed reactivates on
  /// it, and its entry follows: it leaves the old host's bucket, and a
  /// later move is not shadowed by a leftover Seattle entry.
  #[tokio::test]
  async fn test_entry_follows_actor_to_new_host() {
    let ctx = TestContext::new(1, vec![per_host_players()]).await;
    let players: Vec<_> = (0..10).map(|i| player(&format!("p{i}"))).collect();
    for p in &players {
      ctx.set(p, "Location", "Seattle").await.expect("set location");
    }
    assert!(ctx.wait_for_lookup("Location", "Seattle", &players).await);

    let old_host = ctx.runtime.live_nodes()[0];
    let new_host = ctx.runtime.add_node();
    let mover = players
      .iter()
      .find(|p| ctx.runtime.cluster().place(p.placement_hash()) == Some(new_host))
      .expect("some player is placed on the new node")
      .clone();
    let stayers: Vec<_> = players.iter().filter(|p| **p != mover).cloned().collect();

    assert!(ctx.runtime.deactivate(&mover).await);
    let handle = ctx.grain(&mover).await;
    assert_eq!(handle.node(), new_host);

    let relocated = wait_for(SETTLE, || async {
      let hosts = ctx.lookup_per_host("Location", "Seattle").await;
      hosts.iter().any(|(node, found)| *node == new_host && *found == vec![mover.clone()])
        && hosts.iter().any(|(node, found)| *node == old_host && *found == stayers)
    })
    .await;
    assert!(relocated, "Mover's entry should sit only on its new host");

    ctx.set(&mover, "Location", "Portland").await.expect("move");
    assert!(ctx.wait_for_lookup("Location", "Portland", &[mover.clone()]).await);
    assert!(ctx.wait_for_lookup("Location", "Seattle", &stayers).await);
    assert!(ctx.wait_until_drained().await);
    assert_eq!(ctx.lookup("Location", "Seattle").await, stayers);
    assert!(ctx.runtime.cluster().is_alive(old_host));
  }

  /// Test: clearing the property removes the player from the index.
  #[tokio::test]
  async fn test_clearing_property_deletes_entry() {
    let ctx = TestContext::new(2, vec![per_host_players()]).await;
    let p1 = player("p1");

    ctx.set(&p1, "Location", "Seattle").await.expect("set location");
    assert!(ctx.wait_for_lookup("Location", "Seattle", &[p1.clone()]).await);

    ctx
      .grain(&p1)
      .await
      .clear_property("Location")
      .await
      .expect("clear location");
    assert!(ctx.wait_for_lookup("Location", "Seattle", &[]).await);
  }

  /// Test: setting the same value again does not enqueue anything.
  #[tokio::test]
  async fn test_unchanged_value_is_noop() {
    let ctx = TestContext::new(1, vec![per_host_players()]).await;
    let p1 = player("p1");

    assert!(ctx.set(&p1, "Location", "Seattle").await.expect("set").is_some());
    assert!(ctx.set(&p1, "Location", "Seattle").await.expect("set again").is_none());
  }
}
