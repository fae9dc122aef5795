//! Cluster membership for the in-process runtime
//!
//! A node is nothing more than a [`CancellationToken`]: every grain, queue
//! and handler hosted on a node runs under a child of that token, so killing
//! the node cancels all of them at once, the way a silo crash takes down
//! every activation it hosted. Durable state stays in storage and is picked
//! up by whichever live node reactivates the work.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::actor::NodeAddress;

/// Live node enumeration
pub trait Membership: Send + Sync {
  /// Live nodes in ascending address order
  fn live_nodes(&self) -> Vec<NodeAddress>;

  fn is_alive(&self, node: NodeAddress) -> bool;
}

/// Pick a node for `hash` among `nodes` (expected sorted)
pub fn place_among(nodes: &[NodeAddress], hash: u64) -> Option<NodeAddress> {
  if nodes.is_empty() {
    return None;
  }
  Some(nodes[(hash % nodes.len() as u64) as usize])
}

pub struct Cluster {
  nodes: DashMap<NodeAddress, CancellationToken>,
  next_node: AtomicU32,
  cancel: CancellationToken,
}

impl Cluster {
  pub fn new(cancel: CancellationToken) -> Self {
    Self {
      nodes: DashMap::new(),
      next_node: AtomicU32::new(1),
      cancel,
    }
  }

  /// Bring a new node up
  pub fn add_node(&self) -> NodeAddress {
    let node = NodeAddress::new(self.next_node.fetch_add(1, Ordering::SeqCst));
    self.nodes.insert(node, self.cancel.child_token());
    info!(node = %node, "Node joined cluster");
    node
  }

  /// Simulate a node crash: every task hosted on `node` is cancelled
  ///
  /// Returns false when the node was not alive.
  pub fn kill_node(&self, node: NodeAddress) -> bool {
    match self.nodes.remove(&node) {
      Some((_, token)) => {
        token.cancel();
        warn!(node = %node, "Node killed");
        true
      }
      None => false,
    }
  }

  /// Lifetime token of a live node
  pub fn node_token(&self, node: NodeAddress) -> Option<CancellationToken> {
    self.nodes.get(&node).map(|t| t.value().clone())
  }

  /// Stable placement over the current live set
  pub fn place(&self, hash: u64) -> Option<NodeAddress> {
    place_among(&self.live_nodes(), hash)
  }

  pub fn shutdown(&self) {
    self.cancel.cancel();
    self.nodes.clear();
  }
}

impl Membership for Cluster {
  fn live_nodes(&self) -> Vec<NodeAddress> {
    let mut nodes: Vec<_> = self.nodes.iter().map(|entry| *entry.key()).collect();
    nodes.sort();
    nodes
  }

  fn is_alive(&self, node: NodeAddress) -> bool {
    self.nodes.contains_key(&node)
  }
}

impl std::fmt::Debug for Cluster {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Cluster").field("live_nodes", &self.live_nodes()).finish()
  }
}
