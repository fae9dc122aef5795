//! GrainDirectory - single-activation directory for grains
//!
//! Maps actor references to the handle of their current activation,
//! activating on demand on the node chosen by stable placement over the
//! live cluster members.
//!
//! # Design Principles
//!
//! - **Single activation**: a per-actor activation lock ensures that
//!   concurrent callers racing on a cold actor share one activation; the
//!   last caller out removes the lock
//! - **Lock-free reads**: `DashMap` instead of `RwLock<HashMap<...>>`
//! - **Dead handles are misses**: a handle whose task stopped or whose node
//!   left the cluster is never returned
//!
//! # Usage
//!
//! ```ignore
//! let handle = runtime.grain(&ActorRef::new("Player", "p1")).await?;
//! handle.set_property("Location", "Seattle").await?;
//! ```

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{GrainError, grain::Grain, handle::GrainHandle};
use crate::{
  cluster::Membership,
  domain::actor::{ActorRef, NodeAddress},
  runtime::Runtime,
};

#[derive(Default)]
pub struct GrainDirectory {
  grains: DashMap<ActorRef, GrainHandle>,
  activation_locks: DashMap<ActorRef, Arc<Mutex<()>>>,
  incarnations: AtomicU64,
}

impl GrainDirectory {
  pub fn new() -> Self {
    Self::default()
  }

  /// Handle of the live activation, activating the grain if needed
  ///
  /// Activation (including recovery) completes before the handle is
  /// returned.
  pub async fn get_or_activate(&self, runtime: &Arc<Runtime>, actor: &ActorRef) -> Result<GrainHandle, GrainError> {
    if let Some(handle) = self.get_active(runtime, actor) {
      return Ok(handle);
    }

    let node = runtime
      .cluster()
      .place(actor.placement_hash())
      .ok_or(GrainError::NoLiveNodes)?;
    self.activate_on(runtime, actor, node).await
  }

  /// Activate `actor` on a specific node unless it is already active
  pub async fn activate_on(
    &self,
    runtime: &Arc<Runtime>,
    actor: &ActorRef,
    node: NodeAddress,
  ) -> Result<GrainHandle, GrainError> {
    let lock = Arc::clone(self.activation_locks.entry(actor.clone()).or_default().value());
    let result = {
      let _guard = lock.lock().await;
      self.activate_locked(runtime, actor, node).await
    };

    // Only the map and this caller hold it: nobody is waiting
    self
      .activation_locks
      .remove_if(actor, |_, entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2);
    result
  }

  async fn activate_locked(
    &self,
    runtime: &Arc<Runtime>,
    actor: &ActorRef,
    node: NodeAddress,
  ) -> Result<GrainHandle, GrainError> {
    // Another caller may have finished activating while we waited
    if let Some(handle) = self.get_active(runtime, actor) {
      return Ok(handle);
    }

    let catalog = runtime
      .registry()
      .catalog(&actor.actor_type)
      .ok_or_else(|| GrainError::UnknownActorType(actor.actor_type.clone()))?;
    let cancel = runtime.cluster().node_token(node).ok_or(GrainError::NoLiveNodes)?.child_token();
    let incarnation = self.incarnations.fetch_add(1, Ordering::SeqCst) + 1;

    let handle = Grain::activate(Arc::clone(runtime), actor.clone(), node, incarnation, catalog, cancel).await?;
    self.grains.insert(actor.clone(), handle.clone());
    info!(actor = %actor, node = %node, incarnation, "Activated grain");
    Ok(handle)
  }

  /// Handle of the live activation, if any; never activates
  pub fn get_active(&self, runtime: &Runtime, actor: &ActorRef) -> Option<GrainHandle> {
    let handle = self.grains.get(actor).map(|h| h.value().clone())?;
    if handle.is_alive() && runtime.cluster().is_alive(handle.node()) {
      Some(handle)
    } else {
      None
    }
  }

  /// Deactivate an actor; returns false when it was not active
  pub async fn deactivate(&self, actor: &ActorRef) -> bool {
    let Some((_, handle)) = self.grains.remove(actor) else {
      return false;
    };
    match handle.deactivate().await {
      Ok(()) => true,
      Err(e) => {
        debug!(actor = %actor, error = %e, "Grain already stopped");
        false
      }
    }
  }

  /// Actors with an activation in progress or waiters queued on one
  pub fn pending_activations(&self) -> usize {
    self.activation_locks.len()
  }

  /// Called by a stopping grain; only removes the entry it owns
  pub(crate) fn remove_incarnation(&self, actor: &ActorRef, incarnation: u64) {
    self
      .grains
      .remove_if(actor, |_, handle| handle.incarnation() == incarnation);
  }

  /// Node hosting the live activation
  pub fn location(&self, runtime: &Runtime, actor: &ActorRef) -> Option<NodeAddress> {
    self.get_active(runtime, actor).map(|handle| handle.node())
  }

  /// Actors with a live activation
  pub fn list(&self, runtime: &Runtime) -> Vec<ActorRef> {
    let mut actors: Vec<_> = self
      .grains
      .iter()
      .filter(|entry| entry.value().is_alive() && runtime.cluster().is_alive(entry.value().node()))
      .map(|entry| entry.key().clone())
      .collect();
    actors.sort();
    actors
  }
}
