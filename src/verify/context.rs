//! In-flight check state kept on every node
//!
//! At most one check per snapshot name runs at a time. A node keeps one
//! [`CheckContext`] per running check from the first phase until the
//! second phase is reduced, and the originating node additionally keeps
//! the future its caller waits on.

use crate::cluster::{ClusterNode, Completion, NodeId};
use crate::common::{Error, Result};
use crate::snapshot::{ConflictReport, SnapshotMetadata};
use crate::verify::request::VerificationRequest;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ContextState {
    /// Instances this node checks in the second phase
    assigned: Vec<SnapshotMetadata>,
    /// Everything the first phase found; originating node only
    cluster_metas: BTreeMap<ClusterNode, Vec<SnapshotMetadata>>,
}

/// One node's view of a running check
pub struct CheckContext {
    request: VerificationRequest,
    /// Resolved with the reason the local work must stop
    local_process: Completion<Error>,
    state: Mutex<ContextState>,
}

impl CheckContext {
    fn new(request: VerificationRequest) -> Self {
        Self {
            request,
            local_process: Completion::new(),
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn request(&self) -> &VerificationRequest {
        &self.request
    }

    /// Stop the local work. Only the first failure is kept.
    pub fn fail(&self, err: Error) -> bool {
        self.local_process.complete(err)
    }

    pub fn failure(&self) -> Option<Error> {
        self.local_process.peek()
    }

    /// Run `work` unless or until the context fails.
    pub async fn run<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        tokio::select! {
            res = work => res,
            err = self.local_process.wait() => Err(err),
        }
    }

    pub fn set_assigned(&self, metas: Vec<SnapshotMetadata>) {
        lock(&self.state).assigned = metas;
    }

    pub fn assigned(&self) -> Vec<SnapshotMetadata> {
        lock(&self.state).assigned.clone()
    }

    pub fn set_cluster_metas(&self, metas: BTreeMap<ClusterNode, Vec<SnapshotMetadata>>) {
        lock(&self.state).cluster_metas = metas;
    }

    pub fn take_cluster_metas(&self) -> BTreeMap<ClusterNode, Vec<SnapshotMetadata>> {
        std::mem::take(&mut lock(&self.state).cluster_metas)
    }
}

#[derive(Default)]
struct RegistryState {
    stopping: bool,
    contexts: HashMap<String, Arc<CheckContext>>,
}

/// Running checks of one node, by snapshot name
pub struct ContextRegistry {
    local_id: NodeId,
    state: Mutex<RegistryState>,
}

impl ContextRegistry {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Context of `request`, created if no check of its snapshot is running.
    ///
    /// Fails when the node is stopping or another check of the same
    /// snapshot is running.
    pub fn begin_or_reuse(&self, request: &VerificationRequest) -> Result<Arc<CheckContext>> {
        let mut state = lock(&self.state);
        if state.stopping {
            return Err(Error::NodeStopping(self.local_id));
        }

        if let Some(ctx) = state.contexts.get(request.snapshot_name()) {
            if ctx.request().request_id() == request.request_id() {
                return Ok(ctx.clone());
            }
            return Err(Error::AlreadyStarted {
                snapshot: request.snapshot_name().to_string(),
                request_id: ctx.request().request_id(),
            });
        }

        let ctx = Arc::new(CheckContext::new(request.clone()));
        state
            .contexts
            .insert(request.snapshot_name().to_string(), ctx.clone());
        tracing::debug!("Snapshot check context created [{}]", request);
        Ok(ctx)
    }

    /// Context of exactly this request
    pub fn get(&self, request: &VerificationRequest) -> Option<Arc<CheckContext>> {
        lock(&self.state)
            .contexts
            .get(request.snapshot_name())
            .filter(|ctx| ctx.request().request_id() == request.request_id())
            .cloned()
    }

    /// Remove the context of `snapshot` if it belongs to `request_id`.
    pub fn remove(&self, snapshot: &str, request_id: Uuid) -> Option<Arc<CheckContext>> {
        let mut state = lock(&self.state);
        match state.contexts.get(snapshot) {
            Some(ctx) if ctx.request().request_id() == request_id => state.contexts.remove(snapshot),
            _ => None,
        }
    }

    pub fn contexts(&self) -> Vec<Arc<CheckContext>> {
        lock(&self.state).contexts.values().cloned().collect()
    }

    pub fn contains(&self, snapshot: &str) -> bool {
        lock(&self.state).contexts.contains_key(snapshot)
    }

    pub fn is_stopping(&self) -> bool {
        lock(&self.state).stopping
    }

    /// Refuse new checks and hand back the running ones.
    pub fn stop(&self) -> Vec<Arc<CheckContext>> {
        let mut state = lock(&self.state);
        state.stopping = true;
        state.contexts.drain().map(|(_, ctx)| ctx).collect()
    }
}

type ClusterOp = Arc<Completion<Result<ConflictReport>>>;

/// Futures of checks started on this node, by request id
#[derive(Default)]
pub struct ClusterOps {
    ops: Mutex<HashMap<Uuid, ClusterOp>>,
}

impl ClusterOps {
    pub fn register(&self, request_id: Uuid) -> ClusterOp {
        lock(&self.ops)
            .entry(request_id)
            .or_insert_with(|| Arc::new(Completion::new()))
            .clone()
    }

    pub fn contains(&self, request_id: Uuid) -> bool {
        lock(&self.ops).contains_key(&request_id)
    }

    /// Resolve and forget the future of `request_id`. Returns false when
    /// there is none or it was already resolved.
    pub fn complete(&self, request_id: Uuid, outcome: Result<ConflictReport>) -> bool {
        let Some(op) = lock(&self.ops).remove(&request_id) else {
            return false;
        };
        match &outcome {
            Ok(report) => tracing::info!(
                "Finished snapshot validation process [reqId={}, conflicts={}, failedNodes={}]",
                request_id,
                report.has_conflicts(),
                report.exceptions.len()
            ),
            Err(e) => tracing::warn!(
                "Finished snapshot validation process with error [reqId={}, err={}]",
                request_id,
                e
            ),
        }
        op.complete(outcome)
    }

    /// Resolve every pending future with `err`.
    pub fn fail_all(&self, err: &Error) {
        let ops: Vec<ClusterOp> = lock(&self.ops).drain().map(|(_, op)| op).collect();
        for op in ops {
            op.complete(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.ops).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
