//! Cluster-wide phased action: local execution on every node, then reduction
//!
//! A phase is started with a request id and a request. Every addressed node
//! runs its local action; once all of them answered (or left the cluster)
//! the reduce callback receives the per-node results and errors.

use crate::cluster::{NodeId, Topology};
use crate::common::{Error, Result};
use futures_util::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Per-node results; `None` means the node contributed no result.
pub type PhaseResults<Resp> = HashMap<NodeId, Option<Resp>>;

/// Per-node failures
pub type PhaseErrors = HashMap<NodeId, Error>;

/// Runs on every addressed node.
pub type LocalAction<Req, Resp> = Arc<dyn Fn(Req) -> BoxFuture<'static, Result<Option<Resp>>> + Send + Sync>;

/// Receives the request and every node's outcome.
pub type ReduceAction<Req, Resp> =
    Arc<dyn Fn(Uuid, Req, PhaseResults<Resp>, PhaseErrors) + Send + Sync>;

/// The phases of snapshot verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    CheckMetas,
    CheckParts,
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseKind::CheckMetas => write!(f, "check-metas"),
            PhaseKind::CheckParts => write!(f, "check-parts"),
        }
    }
}

/// A named cluster-wide two-step action.
pub trait DistributedProcess<Req, Resp>: Send + Sync {
    /// Registers the callbacks `node` runs for this process.
    fn register(&self, node: NodeId, local: LocalAction<Req, Resp>, reduce: ReduceAction<Req, Resp>);

    /// Removes a node's callbacks.
    fn deregister(&self, node: NodeId);

    /// Starts the process. Returns immediately.
    fn start(&self, request_id: Uuid, request: Req);
}

struct Endpoint<Req, Resp> {
    local: LocalAction<Req, Resp>,
    reduce: ReduceAction<Req, Resp>,
}

impl<Req, Resp> Clone for Endpoint<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            reduce: self.reduce.clone(),
        }
    }
}

/// In-memory phase delivery between nodes sharing one [`Topology`].
///
/// Local actions run concurrently on every alive registered node. A node
/// that departs before answering is dropped from both maps. Reductions are
/// delivered to every alive node, the coordinator last.
pub struct InProcessPhase<Req, Resp> {
    kind: PhaseKind,
    topology: Topology,
    endpoints: Arc<Mutex<HashMap<NodeId, Endpoint<Req, Resp>>>>,
}

impl<Req, Resp> InProcessPhase<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + 'static,
{
    pub fn new(kind: PhaseKind, topology: Topology) -> Self {
        Self {
            kind,
            topology,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn endpoints(
        endpoints: &Mutex<HashMap<NodeId, Endpoint<Req, Resp>>>,
    ) -> std::sync::MutexGuard<'_, HashMap<NodeId, Endpoint<Req, Resp>>> {
        endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(
        kind: PhaseKind,
        topology: Topology,
        endpoints: Arc<Mutex<HashMap<NodeId, Endpoint<Req, Resp>>>>,
        request_id: Uuid,
        request: Req,
    ) {
        let participants: Vec<(NodeId, Endpoint<Req, Resp>)> = {
            let registered = Self::endpoints(&endpoints);
            topology
                .alive_nodes()
                .into_iter()
                .filter_map(|n| registered.get(&n.id).map(|e| (n.id, e.clone())))
                .collect()
        };

        tracing::debug!(
            "Phase {} started [reqId={}, nodes={}]",
            kind,
            request_id,
            participants.len()
        );

        let outcomes = join_all(participants.into_iter().map(|(node, endpoint)| {
            let topology = topology.clone();
            let request = request.clone();
            async move {
                tokio::select! {
                    res = (endpoint.local)(request) => Some((node, res)),
                    _ = topology.departed(node) => None,
                }
            }
        }))
        .await;

        let mut results = PhaseResults::new();
        let mut errors = PhaseErrors::new();
        for (node, outcome) in outcomes.into_iter().flatten() {
            match outcome {
                Ok(res) => {
                    results.insert(node, res);
                }
                Err(e) => {
                    errors.insert(node, e);
                }
            }
        }

        // Alive nodes may have changed while waiting.
        let mut receivers: Vec<(NodeId, ReduceAction<Req, Resp>)> = {
            let registered = Self::endpoints(&endpoints);
            topology
                .alive_nodes()
                .into_iter()
                .filter_map(|n| registered.get(&n.id).map(|e| (n.id, e.reduce.clone())))
                .collect()
        };
        if let Some(coordinator) = topology.coordinator() {
            // Stable sort keeps join order for the rest.
            receivers.sort_by_key(|(id, _)| *id == coordinator.id);
        }

        tracing::debug!(
            "Phase {} reducing [reqId={}, results={}, errors={}]",
            kind,
            request_id,
            results.len(),
            errors.len()
        );

        for (_, reduce) in receivers {
            reduce(request_id, request.clone(), results.clone(), errors.clone());
        }
    }
}

impl<Req, Resp> DistributedProcess<Req, Resp> for InProcessPhase<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + 'static,
{
    fn register(&self, node: NodeId, local: LocalAction<Req, Resp>, reduce: ReduceAction<Req, Resp>) {
        Self::endpoints(&self.endpoints).insert(node, Endpoint { local, reduce });
    }

    fn deregister(&self, node: NodeId) {
        Self::endpoints(&self.endpoints).remove(&node);
    }

    fn start(&self, request_id: Uuid, request: Req) {
        tokio::spawn(Self::run(
            self.kind,
            self.topology.clone(),
            self.endpoints.clone(),
            request_id,
            request,
        ));
    }
}
