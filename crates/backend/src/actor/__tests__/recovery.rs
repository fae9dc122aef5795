//! Activation-time recovery of fault-tolerant actors.

#[cfg(test)]
mod tests {
  use std::collections::{BTreeMap, BTreeSet};

  use crate::{
    actor::{
      __tests__::helpers::{SETTLE, TestContext, player, player_type, wait_for},
      grain::GrainState,
    },
    domain::{
      actor::{IndexName, NodeAddress},
      image::{Image, PropertyBag},
      update::MemberUpdate,
    },
    workflow::{WorkflowId, WorkflowQueueId, WorkflowRecord},
  };

  /// Test: active set {A, B} with only A still queued. Right after
  /// activation the persisted set is exactly {A}, B is never re-enqueued,
  /// and A is eventually applied.
  ///
  /// The handler needs the grain's answer before it can confirm A, and the
  /// single-threaded test runtime does not run it between activation and
  /// the state read below.
  #[tokio::test]
  async fn test_recovery_keeps_only_queued_workflows() {
    let ctx = TestContext::new(1, vec![player_type(true)]).await;
    let storage = ctx.storage();
    let p1 = player("p1");
    let (a, b) = (WorkflowId::new(), WorkflowId::new());

    let record_a = WorkflowRecord::new(
      a,
      p1.clone(),
      1,
      NodeAddress::new(1),
      BTreeMap::from([(IndexName::new("Location"), MemberUpdate::insert(Image::from("Seattle")))]),
    );
    let queue_id = WorkflowQueueId::for_actor(&p1, ctx.runtime.queues().shard_count());
    storage
      .save_json(&queue_id.storage_key(), &serde_json::json!({ "records": [record_a] }))
      .await
      .expect("seed queue");

    let state = GrainState {
      properties: PropertyBag::new().with("Location", "Seattle"),
      before_images: BTreeMap::from([(IndexName::new("Location"), Image::from("Seattle"))]),
      active_workflows: BTreeSet::from([a, b]),
      sequence: 2,
      index_host: None,
    };
    storage.save_json(&p1.storage_key(), &state).await.expect("seed grain");

    ctx.grain(&p1).await;

    let persisted: GrainState = storage
      .load_json(&p1.storage_key())
      .await
      .expect("load grain state")
      .expect("grain state exists");
    assert_eq!(persisted.active_workflows, BTreeSet::from([a]), "B was applied before the crash");

    let queue = ctx.runtime.queues().cached(&queue_id).expect("queue activated by recovery");
    let remaining = queue
      .get_remaining_workflows_in(&p1, BTreeSet::from([a, b]))
      .await
      .expect("query queue");
    assert!(remaining.iter().all(|record| record.workflow_id == a), "B must not be re-enqueued");

    assert!(ctx.wait_for_lookup("Location", "Seattle", &[p1.clone()]).await);
    let handle = ctx.grain(&p1).await;
    assert!(
      wait_for(SETTLE, || async {
        matches!(handle.get_active_workflows().await, Ok(Some(active)) if active.is_empty())
      })
      .await
    );
  }

  /// Test: a plain actor type carries no active set and skips recovery.
  #[tokio::test]
  async fn test_plain_type_has_no_active_set() {
    let ctx = TestContext::new(1, vec![player_type(false)]).await;
    let p1 = player("p1");

    ctx.set(&p1, "Location", "Seattle").await.expect("set");
    let active = ctx.grain(&p1).await.get_active_workflows().await.expect("query");
    assert!(active.is_none());
    assert!(ctx.wait_for_lookup("Location", "Seattle", &[p1]).await);
  }

  /// Test: state and before-images survive deactivation, so the next
  /// mutation moves the entry instead of adding a second one.
  #[tokio::test]
  async fn test_before_image_survives_deactivation() {
    let ctx = TestContext::new(1, vec![player_type(true)]).await;
    let p1 = player("p1");

    ctx.set(&p1, "Location", "Seattle").await.expect("set");
    assert!(ctx.wait_for_lookup("Location", "Seattle", &[p1.clone()]).await);
    assert!(ctx.runtime.deactivate(&p1).await);

    let props = ctx.grain(&p1).await.get_properties().await.expect("properties");
    assert_eq!(props.get("Location"), Some(&Image::from("Seattle")));

    ctx.set(&p1, "Location", "Denver").await.expect("move");
    assert!(ctx.wait_for_lookup("Location", "Denver", &[p1.clone()]).await);
    assert!(ctx.wait_for_lookup("Location", "Seattle", &[]).await);
  }
}
