//! Cluster topology and membership events
//!
//! Tracks alive nodes with their join order, remembers departed nodes so
//! late results can still be attributed, and publishes join/leave/fail
//! events to subscribers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Transient node identifier
pub type NodeId = Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    /// Stable identity, survives restarts
    pub consistent_id: String,
    /// Join order, lower is older
    pub order: u64,
    /// Member of the persistence baseline
    pub baseline: bool,
}

impl ClusterNode {
    pub fn new(id: NodeId, consistent_id: impl Into<String>, order: u64, baseline: bool) -> Self {
        Self {
            id,
            consistent_id: consistent_id.into(),
            order,
            baseline,
        }
    }

    /// Placeholder for an id the topology never saw.
    pub fn unknown(id: NodeId) -> Self {
        Self::new(id, id.to_string(), u64::MAX, false)
    }
}

impl Ord for ClusterNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ClusterNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "consId={}, nodeId={}, order={}",
            self.consistent_id, self.id, self.order
        )
    }
}

/// Membership change notification
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeJoined(ClusterNode),
    NodeLeft(ClusterNode),
    NodeFailed(ClusterNode),
}

impl ClusterEvent {
    pub fn node(&self) -> &ClusterNode {
        match self {
            ClusterEvent::NodeJoined(n) | ClusterEvent::NodeLeft(n) | ClusterEvent::NodeFailed(n) => n,
        }
    }

    /// Does this event remove the node from the cluster?
    pub fn is_departure(&self) -> bool {
        matches!(self, ClusterEvent::NodeLeft(_) | ClusterEvent::NodeFailed(_))
    }
}

#[derive(Default)]
struct TopologyState {
    alive: BTreeMap<NodeId, ClusterNode>,
    departed: HashMap<NodeId, ClusterNode>,
    next_order: u64,
}

/// Shared discovery view. Cloning yields a handle to the same topology.
#[derive(Clone)]
pub struct Topology {
    state: Arc<RwLock<TopologyState>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(TopologyState {
                next_order: 1,
                ..Default::default()
            })),
            events,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TopologyState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TopologyState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a node; it gets the next join order.
    pub fn join(&self, consistent_id: impl Into<String>, baseline: bool) -> ClusterNode {
        let node = {
            let mut state = self.write();
            let node = ClusterNode::new(Uuid::new_v4(), consistent_id, state.next_order, baseline);
            state.next_order += 1;
            state.alive.insert(node.id, node.clone());
            node
        };

        tracing::info!("Node joined [{}, baseline={}]", node, node.baseline);
        let _ = self.events.send(ClusterEvent::NodeJoined(node.clone()));
        node
    }

    /// Graceful departure
    pub fn leave(&self, id: NodeId) -> Option<ClusterNode> {
        self.depart(id, false)
    }

    /// Abrupt departure
    pub fn fail(&self, id: NodeId) -> Option<ClusterNode> {
        self.depart(id, true)
    }

    fn depart(&self, id: NodeId, failed: bool) -> Option<ClusterNode> {
        let node = {
            let mut state = self.write();
            let node = state.alive.remove(&id)?;
            state.departed.insert(id, node.clone());
            node
        };

        let event = if failed {
            tracing::warn!("Node failed [{}]", node);
            ClusterEvent::NodeFailed(node.clone())
        } else {
            tracing::info!("Node left [{}]", node);
            ClusterEvent::NodeLeft(node.clone())
        };
        let _ = self.events.send(event);
        Some(node)
    }

    /// Alive node by id
    pub fn node(&self, id: NodeId) -> Option<ClusterNode> {
        self.read().alive.get(&id).cloned()
    }

    /// Alive or departed node by id
    pub fn lookup(&self, id: NodeId) -> ClusterNode {
        let state = self.read();
        state
            .alive
            .get(&id)
            .or_else(|| state.departed.get(&id))
            .cloned()
            .unwrap_or_else(|| ClusterNode::unknown(id))
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.read().alive.contains_key(&id)
    }

    /// Alive nodes sorted by join order
    pub fn alive_nodes(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<_> = self.read().alive.values().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn alive_baseline_nodes(&self) -> Vec<ClusterNode> {
        self.alive_nodes().into_iter().filter(|n| n.baseline).collect()
    }

    /// Is the node alive and part of the baseline?
    pub fn is_baseline(&self, id: NodeId) -> bool {
        self.node(id).map(|n| n.baseline).unwrap_or(false)
    }

    /// The oldest alive node
    pub fn coordinator(&self) -> Option<ClusterNode> {
        self.read().alive.values().min().cloned()
    }

    pub fn is_coordinator(&self, id: NodeId) -> bool {
        self.coordinator().map(|c| c.id == id).unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Resolves once the node is no longer alive.
    pub async fn departed(&self, id: NodeId) {
        // Subscribe before checking so a departure in between is not missed.
        let mut events = self.subscribe();
        if !self.is_alive(id) {
            return;
        }

        loop {
            match events.recv().await {
                Ok(event) if event.is_departure() && event.node().id == id => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if !self.is_alive(id) {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_join_order_and_coordinator() {
        let topology = Topology::new();
        let a = topology.join("a", true);
        let b = topology.join("b", true);
        let c = topology.join("c", false);

        assert!(a.order < b.order && b.order < c.order);
        assert_eq!(topology.coordinator().unwrap().id, a.id);
        assert_eq!(topology.alive_baseline_nodes().len(), 2);

        topology.leave(a.id);
        assert!(topology.is_coordinator(b.id));
        assert_eq!(topology.lookup(a.id).consistent_id, "a");
        assert!(topology.node(a.id).is_none());
    }

    #[test]
    fn test_events_published() {
        let topology = Topology::new();
        let mut events = topology.subscribe();
        let a = topology.join("a", true);
        topology.fail(a.id);

        assert!(matches!(events.try_recv().unwrap(), ClusterEvent::NodeJoined(_)));
        match events.try_recv().unwrap() {
            ClusterEvent::NodeFailed(n) => assert_eq!(n.id, a.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_departed_resolves() {
        let topology = Topology::new();
        let a = topology.join("a", true);

        let waiter = {
            let topology = topology.clone();
            tokio::spawn(async move { topology.departed(a.id).await })
        };
        tokio::task::yield_now().await;
        topology.leave(a.id);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already gone resolves immediately
        topology.departed(a.id).await;
    }
}
