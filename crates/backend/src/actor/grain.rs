//! Grain - one activation of an indexable actor
//!
//! A grain owns its property bag and an [`IndexableActor`]. Messages are
//! handled one at a time; a `SetProperties` request is acknowledged only
//! after index maintenance succeeded and the new state was written.
//!
//! Activation loads durable state, seeds before-images, runs the recovery
//! protocol for fault-tolerant types, relocates per-host index entries left
//! on another node, and only then starts serving.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::{GrainError, handle::GrainHandle, indexable::IndexableActor, message::GrainMessage};
use crate::{
  domain::{
    actor::{ActorRef, IndexName, NodeAddress},
    image::{Image, PropertyBag, PropertyPatch},
  },
  index::TypeCatalog,
  runtime::Runtime,
  storage::StorageProvider,
  workflow::WorkflowId,
};

/// Durable state of one grain
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct GrainState {
  pub(crate) properties: PropertyBag,
  pub(crate) before_images: BTreeMap<IndexName, Image>,
  pub(crate) active_workflows: BTreeSet<WorkflowId>,
  pub(crate) sequence: u64,
  pub(crate) index_host: Option<NodeAddress>,
}

pub struct Grain {
  reference: ActorRef,
  incarnation: u64,
  runtime: Arc<Runtime>,
  storage: Arc<dyn StorageProvider>,
  properties: PropertyBag,
  indexing: IndexableActor,
  rx: mpsc::Receiver<GrainMessage>,
  cancel: CancellationToken,
}

impl Grain {
  /// Activate `reference` on `node` and return its handle once recovery is done
  pub async fn activate(
    runtime: Arc<Runtime>,
    reference: ActorRef,
    node: NodeAddress,
    incarnation: u64,
    catalog: Arc<TypeCatalog>,
    cancel: CancellationToken,
  ) -> Result<GrainHandle, GrainError> {
    let storage = runtime.storage().resolve(catalog.storage.as_deref())?;
    let state = storage
      .load_json::<GrainState>(&reference.storage_key())
      .await?
      .unwrap_or_default();

    let mut indexing = IndexableActor::new(
      reference.clone(),
      node,
      Arc::clone(&runtime),
      catalog,
      state.before_images,
      state.active_workflows,
      state.sequence,
      state.index_host,
    );
    let seeded = indexing.seed_before_images(&state.properties);
    let recovered = indexing.on_activate().await?;
    let relocated = indexing.relocate_host_entries().await?;

    let (tx, rx) = mpsc::channel(runtime.config().actor.mailbox_capacity.max(1));
    let grain = Self {
      reference: reference.clone(),
      incarnation,
      runtime,
      storage,
      properties: state.properties,
      indexing,
      rx,
      cancel,
    };
    if seeded || recovered || relocated {
      grain.persist().await?;
    }

    debug!(actor = %reference, node = %node, incarnation, "Grain activated");
    tokio::spawn(grain.run());
    Ok(GrainHandle::new(reference, node, incarnation, tx))
  }

  async fn run(mut self) {
    loop {
      tokio::select! {
          biased;

          _ = self.cancel.cancelled() => {
              debug!(actor = %self.reference, "Grain stopping (node down)");
              break;
          }

          msg = self.rx.recv() => {
              match msg {
                  Some(GrainMessage::Deactivate { reply }) => {
                      info!(actor = %self.reference, "Grain deactivated");
                      let _ = reply.send(());
                      break;
                  }
                  Some(msg) => self.handle(msg).await,
                  None => break,
              }
          }
      }
    }

    self.runtime.grains().remove_incarnation(&self.reference, self.incarnation);
  }

  async fn handle(&mut self, msg: GrainMessage) {
    match msg {
      GrainMessage::SetProperties { patch, reply } => {
        let _ = reply.send(self.set_properties(patch).await);
      }
      GrainMessage::GetProperties { reply } => {
        let _ = reply.send(self.properties.clone());
      }
      GrainMessage::GetActiveWorkflows { reply } => {
        let _ = reply.send(self.indexing.active_workflows().cloned());
      }
      GrainMessage::RemoveFromActiveWorkflows { ids, reply } => {
        let result = if self.indexing.remove_active(&ids) {
          trace!(actor = %self.reference, removed = ids.len(), "Trimmed active workflows");
          self.persist().await
        } else {
          Ok(())
        };
        let _ = reply.send(result);
      }
      // Handled in the run loop
      GrainMessage::Deactivate { reply } => {
        let _ = reply.send(());
      }
    }
  }

  /// Apply a patch; the new state is kept only once it is durable
  ///
  /// When the write fails the grain rolls back to its previous properties
  /// and index bookkeeping, and its synchronous index writes are undone.
  async fn set_properties(&mut self, patch: PropertyPatch) -> Result<Option<WorkflowId>, GrainError> {
    let mut next = self.properties.clone();
    if !next.apply(&patch) {
      return Ok(None);
    }

    let pending = self.indexing.prepare_mutation(&self.properties, &next).await?;
    let workflow_id = pending.workflow_id;
    let undo = self.indexing.commit(pending);
    let previous = std::mem::replace(&mut self.properties, next);

    if let Err(e) = self.persist().await {
      error!(actor = %self.reference, error = %e, "Failed to persist grain state, rolling back");
      self.properties = previous;
      self.indexing.rollback(undo).await;
      return Err(e);
    }
    trace!(actor = %self.reference, workflow = ?workflow_id, "Properties updated");
    Ok(workflow_id)
  }

  async fn persist(&self) -> Result<(), GrainError> {
    let state = GrainState {
      properties: self.properties.clone(),
      before_images: self.indexing.before_images().clone(),
      active_workflows: self.indexing.active_workflows().cloned().unwrap_or_default(),
      sequence: self.indexing.sequence(),
      index_host: self.indexing.index_host(),
    };
    self.storage.save_json(&self.reference.storage_key(), &state).await?;
    Ok(())
  }
}
