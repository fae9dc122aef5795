//! Unique index scenarios: eager on plain types, tentative on
//! fault-tolerant ones.

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use crate::{
    actor::__tests__::helpers::{SETTLE, TestContext, wait_for},
    domain::{
      actor::{ActorRef, IndexName, NodeAddress},
      image::{Image, PropertyPatch},
      update::MemberUpdate,
    },
    index::{ActorTypeConfig, IndexDeclaration, PropertyGenerator},
    workflow::{WorkflowId, WorkflowQueueId, WorkflowRecord},
  };

  fn user(id: &str) -> ActorRef {
    ActorRef::new("User", id)
  }

  fn users() -> ActorTypeConfig {
    ActorTypeConfig::new("User").index(IndexDeclaration::new("Email", PropertyGenerator::new("Email")).unique().eager())
  }

  fn accounts() -> ActorTypeConfig {
    ActorTypeConfig::new("Account")
      .fault_tolerant()
      .index(IndexDeclaration::new("Handle", PropertyGenerator::new("Handle")).unique())
  }

  /// Test: two users racing for one email; exactly one wins and the
  /// loser's state is untouched.
  #[tokio::test]
  async fn test_eager_unique_email_race() {
    let ctx = TestContext::new(2, vec![users()]).await;
    let (u1, u2) = (user("u1"), user("u2"));
    let (h1, h2) = (ctx.grain(&u1).await, ctx.grain(&u2).await);

    let (r1, r2) = tokio::join!(
      h1.set_property("Email", "neo@example.com"),
      h2.set_property("Email", "neo@example.com")
    );

    let (winner, loser, loser_handle, err) = match (r1, r2) {
      (Ok(_), Err(e)) => (u1.clone(), u2.clone(), &h2, e),
      (Err(e), Ok(_)) => (u2.clone(), u1.clone(), &h1, e),
      other => panic!("Exactly one writer should win: {other:?}"),
    };
    assert!(err.is_uniqueness_violation(), "Loser should see a uniqueness violation: {err}");

    // Eager: visible as soon as the call returns
    let owner = ctx
      .runtime
      .lookup_unique(&IndexName::new("Email"), &Image::from("neo@example.com"))
      .await
      .expect("lookup owner");
    assert_eq!(owner, winner);

    let props = loser_handle.get_properties().await.expect("loser properties");
    assert!(props.get("Email").is_none(), "Rejected mutation must not change state");

    // Freed once the winner moves on
    ctx.set(&winner, "Email", "trinity@example.com").await.expect("winner moves");
    ctx.set(&loser, "Email", "neo@example.com").await.expect("loser takes freed email");
    assert_eq!(ctx.lookup("Email", "neo@example.com").await, vec![loser]);
  }

  /// Test: a failed mutation undoes what its eager writes actually did. The
  /// Email update lands as an insert because the bucket lost the old
  /// address, so undoing it must not put the old address back.
  #[tokio::test]
  async fn test_failed_mutation_undoes_effective_writes() {
    let profiles = ActorTypeConfig::new("Profile")
      .index(IndexDeclaration::new("Email", PropertyGenerator::new("Email")).unique().eager())
      .index(IndexDeclaration::new("Nick", PropertyGenerator::new("Nick")).unique().eager());
    let ctx = TestContext::new(1, vec![profiles]).await;
    let (p1, p2) = (ActorRef::new("Profile", "p1"), ActorRef::new("Profile", "p2"));

    let patch = |email: &str, nick: &str| -> PropertyPatch {
      BTreeMap::from([
        ("Email".to_string(), Some(Image::from(email))),
        ("Nick".to_string(), Some(Image::from(nick))),
      ])
    };
    let h1 = ctx.grain(&p1).await;
    h1.set_properties(patch("old@example.com", "neo")).await.expect("p1 profile");
    ctx.set(&p2, "Nick", "trinity").await.expect("p2 nick");

    // The bucket no longer holds p1's address
    let email = ctx.runtime.index(&IndexName::new("Email")).expect("Email index");
    email
      .router
      .apply_update(&p1, &MemberUpdate::delete(Image::from("old@example.com")), h1.node())
      .await
      .expect("drop entry");

    let err = h1
      .set_properties(patch("new@example.com", "trinity"))
      .await
      .expect_err("Nick is taken");
    assert!(err.is_uniqueness_violation());

    assert!(ctx.lookup("Email", "old@example.com").await.is_empty());
    assert!(ctx.lookup("Email", "new@example.com").await.is_empty());
    assert_eq!(ctx.lookup("Nick", "neo").await, vec![p1.clone()]);
    assert_eq!(ctx.lookup("Nick", "trinity").await, vec![p2]);

    let props = h1.get_properties().await.expect("properties");
    assert_eq!(props.get("Email"), Some(&Image::from("old@example.com")));
  }

  /// Test: a fault-tolerant unique index is written tentatively before the
  /// mutation returns, so a conflicting writer is rejected right away.
  #[tokio::test]
  async fn test_tentative_unique_rejects_conflict() {
    let ctx = TestContext::new(2, vec![accounts()]).await;
    let (a1, a2) = (ActorRef::new("Account", "a1"), ActorRef::new("Account", "a2"));

    ctx.set(&a1, "Handle", "neo").await.expect("a1 claims handle");
    assert_eq!(ctx.lookup("Handle", "neo").await, vec![a1.clone()]);

    let err = ctx.set(&a2, "Handle", "neo").await.expect_err("a2 must be rejected");
    assert!(err.is_uniqueness_violation());

    assert!(ctx.wait_until_drained().await);
    assert_eq!(ctx.lookup("Handle", "neo").await, vec![a1]);
  }

  /// Test: a tentative write whose mutation never committed is undone when
  /// the handler finds the workflow inactive.
  #[tokio::test]
  async fn test_uncommitted_tentative_write_is_reversed() {
    let ctx = TestContext::new(1, vec![accounts()]).await;
    let a3 = ActorRef::new("Account", "a3");
    let update = MemberUpdate::insert(Image::from("trinity"));

    // The tentative write landed, then the actor died before committing
    let handle_index = ctx.runtime.index(&IndexName::new("Handle")).expect("Handle index");
    handle_index
      .router
      .apply_update(&a3, &update, NodeAddress::new(1))
      .await
      .expect("tentative write");
    assert_eq!(ctx.lookup("Handle", "trinity").await, vec![a3.clone()]);

    let record = WorkflowRecord::new(
      WorkflowId::new(),
      a3.clone(),
      1,
      NodeAddress::new(1),
      BTreeMap::from([(IndexName::new("Handle"), update)]),
    );
    let queue_id = WorkflowQueueId::for_actor(&a3, ctx.runtime.queues().shard_count());
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

    assert!(
      wait_for(SETTLE, || async { ctx.lookup("Handle", "trinity").await.is_empty() }).await,
      "Inactive workflow should have its tentative write reversed"
    );
    assert!(ctx.wait_until_drained().await);
  }
}
