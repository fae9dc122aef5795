//! Node failure: grains reactivate elsewhere, queues reincarnate from
//! their durable record lists.

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use crate::{
    actor::__tests__::helpers::{TestContext, per_host_player_type, player, player_type},
    domain::{
      actor::{IndexName, NodeAddress},
      image::Image,
      update::MemberUpdate,
    },
    workflow::{WorkflowId, WorkflowQueueId, WorkflowRecord},
  };

  /// Test: killing the queue's host reincarnates it on a survivor, and
  /// index maintenance keeps flowing.
  #[tokio::test]
  async fn test_queue_reincarnates_after_node_failure() {
    let ctx = TestContext::new(3, vec![player_type(false)]).await;
    let players: Vec<_> = (1..=4).map(|i| player(&format!("p{i}"))).collect();

    for p in &players {
      ctx.set(p, "Location", "Seattle").await.expect("set location");
    }
    assert!(ctx.wait_for_lookup("Location", "Seattle", &players).await);

    let live = ctx.runtime.queues().live(&ctx.runtime);
    assert_eq!(live.len(), 1, "One shard, one queue");
    let before = live[0].clone();

    assert!(ctx.runtime.kill_node(before.node()).await);
    assert!(!ctx.runtime.is_queue_live(&before));

    let live = ctx.runtime.queues().live(&ctx.runtime);
    assert_eq!(live.len(), 1);
    assert_ne!(live[0].node(), before.node());
    assert!(live[0].incarnation() > before.incarnation());

    // Grains that lived on the failed node reactivate on survivors
    for p in &players {
      ctx.set(p, "Location", "Boston").await.expect("move after failure");
    }
    assert!(ctx.wait_for_lookup("Location", "Boston", &players).await);
    assert!(ctx.wait_for_lookup("Location", "Seattle", &[]).await);

    for p in &players {
      let node = ctx.runtime.grains().location(&ctx.runtime, p).expect("active grain");
      assert_ne!(node, before.node());
    }
  }

  /// Test: a node holding per-host buckets dies. Every player reactivates
  /// on the survivor and writes its entry there, so lookups find all six
  /// again.
  #[tokio::test]
  async fn test_per_host_entries_restored_after_node_failure() {
    let ctx = TestContext::new(2, vec![per_host_player_type()]).await;
    let players: Vec<_> = (0..6).map(|i| player(&format!("p{i}"))).collect();
    for p in &players {
      ctx.set(p, "Location", "Seattle").await.expect("set location");
    }
    assert!(ctx.wait_for_lookup("Location", "Seattle", &players).await);

    let failed = ctx.runtime.grains().location(&ctx.runtime, &players[0]).expect("active grain");
    assert!(ctx.runtime.kill_node(failed).await);
    assert!(ctx.lookup("Location", "Seattle").await.len() < players.len());

    for p in &players {
      let handle = ctx.grain(p).await;
      assert_ne!(handle.node(), failed);
    }
    assert!(
      ctx.wait_for_lookup("Location", "Seattle", &players).await,
      "Players from the failed node should be indexed on the survivor"
    );
    assert!(ctx.wait_until_drained().await);
  }

  /// Test: records persisted by a failed incarnation are drained by the next.
  #[tokio::test]
  async fn test_reincarnated_queue_drains_persisted_records() {
    let ctx = TestContext::new(2, vec![player_type(false)]).await;
    let p9 = player("p9");

    let record = WorkflowRecord::new(
      WorkflowId::new(),
      p9.clone(),
      1,
      NodeAddress::new(1),
      BTreeMap::from([(IndexName::new("Location"), MemberUpdate::insert(Image::from("Lisbon")))]),
    );
    let queue_id = WorkflowQueueId::for_actor(&p9, ctx.runtime.queues().shard_count());
    ctx
      .storage()
      .save_json(&queue_id.storage_key(), &serde_json::json!({ "records": [record] }))
      .await
      .expect("seed queue");

    ctx
      .runtime
      .queues()
      .resolve(&ctx.runtime, &queue_id)
      .await
      .expect("activate queue");

    assert!(ctx.wait_for_lookup("Location", "Lisbon", &[p9]).await);
    assert!(ctx.wait_until_drained().await);
  }
}
