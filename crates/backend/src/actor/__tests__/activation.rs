//! Single activation under concurrent callers.

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use futures::future::join_all;

  use crate::{
    actor::{
      GrainError,
      __tests__::helpers::{TestContext, player, player_type},
    },
    domain::actor::ActorRef,
  };

  /// Test: callers racing on a cold actor share one activation, and no
  /// activation lock outlives the activations.
  #[tokio::test]
  async fn test_concurrent_callers_share_one_activation() {
    let ctx = TestContext::new(2, vec![player_type(true)]).await;
    let p1 = player("p1");

    let attempts = (0..8).map(|_| {
      let runtime = Arc::clone(&ctx.runtime);
      let actor = p1.clone();
      tokio::spawn(async move { runtime.grain(&actor).await })
    });
    let handles: Vec<_> = join_all(attempts)
      .await
      .into_iter()
      .map(|joined| joined.expect("task").expect("activate"))
      .collect();

    let incarnation = handles[0].incarnation();
    assert!(handles.iter().all(|h| h.incarnation() == incarnation));
    assert_eq!(ctx.runtime.grains().pending_activations(), 0);
  }

  /// Test: activating and deactivating many actors leaves no lock entries.
  #[tokio::test]
  async fn test_activation_locks_are_released() {
    let ctx = TestContext::new(3, vec![player_type(false)]).await;
    let players: Vec<_> = (0..20).map(|i| player(&format!("p{i}"))).collect();

    for round in 0..3 {
      for p in &players {
        ctx.set(p, "Location", format!("City {round}")).await.expect("set");
      }
      for p in &players {
        assert!(ctx.runtime.deactivate(p).await);
      }
    }
    assert_eq!(ctx.runtime.grains().pending_activations(), 0);

    let unknown = ActorRef::new("Ghost", "g1");
    assert!(matches!(
      ctx.runtime.grain(&unknown).await,
      Err(GrainError::UnknownActorType(_))
    ));
    assert_eq!(ctx.runtime.grains().pending_activations(), 0);
  }
}
