//! Cluster-wide snapshot check
//!
//! A check runs in two phases over every alive node:
//!
//! 1. Every required node reads the snapshot metadata it holds. The
//!    reduction checks the metadata is consistent and complete, and every
//!    node works out which instances it checks next. The coordinator then
//!    starts the second phase.
//! 2. Every node checks its assigned instances. The reduction removes the
//!    check context, and the node that started the check builds the report
//!    its caller waits for.
//!
//! A required node leaving fails the check.

use crate::cluster::{
    ClusterNode, Completion, DistributedProcess, LocalAction, NodeId, PhaseErrors, PhaseResults,
    ReduceAction, Topology,
};
use crate::common::{validate_snapshot_name, Error, Result};
use crate::snapshot::{reduce_metas_results, ConflictReport, HandlerRegistry, SnapshotMetadata, SnapshotStorage};
use crate::verify::assignment::assign_metas_to_work;
use crate::verify::context::{ClusterOps, ContextRegistry};
use crate::verify::membership::{handle_node_left, spawn_listener};
use crate::verify::reducer;
use crate::verify::request::{CheckOptions, VerificationRequest};
use crate::verify::response::CheckResponse;
use crate::verify::strategy::{self, CheckStrategy};
use futures_util::future::{self, BoxFuture, FutureExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// First phase: collect snapshot metadata
pub type MetasPhase = Arc<dyn DistributedProcess<VerificationRequest, Vec<SnapshotMetadata>>>;

/// Second phase: check partitions
pub type PartsPhase = Arc<dyn DistributedProcess<VerificationRequest, CheckResponse>>;

/// Snapshot check process of one node
pub struct SnapshotCheckProcess {
    local_id: NodeId,
    topology: Topology,
    storage: Arc<dyn SnapshotStorage>,
    handlers: Arc<HandlerRegistry>,
    metas_phase: MetasPhase,
    parts_phase: PartsPhase,
    registry: ContextRegistry,
    cluster_ops: ClusterOps,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotCheckProcess {
    /// Create the process of `local_id` and register it with both phases.
    pub fn new(
        local_id: NodeId,
        topology: Topology,
        storage: Arc<dyn SnapshotStorage>,
        handlers: HandlerRegistry,
        metas_phase: MetasPhase,
        parts_phase: PartsPhase,
    ) -> Arc<Self> {
        // Subscribe before anything can start.
        let events = topology.subscribe();

        let process = Arc::new(Self {
            local_id,
            topology,
            storage,
            handlers: Arc::new(handlers),
            metas_phase,
            parts_phase,
            registry: ContextRegistry::new(local_id),
            cluster_ops: ClusterOps::default(),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&process);
        let local: LocalAction<VerificationRequest, Vec<SnapshotMetadata>> = Arc::new({
            let weak = weak.clone();
            move |req: VerificationRequest| -> BoxFuture<'static, Result<Option<Vec<SnapshotMetadata>>>> {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(process) => process.prepare_and_check_metas(req).await,
                        None => Ok(None),
                    }
                }
                .boxed()
            }
        });
        let reduce: ReduceAction<VerificationRequest, Vec<SnapshotMetadata>> = Arc::new({
            let weak = weak.clone();
            move |id: Uuid,
                  req: VerificationRequest,
                  results: PhaseResults<Vec<SnapshotMetadata>>,
                  errors: PhaseErrors| {
                if let Some(process) = weak.upgrade() {
                    process.reduce_metas(id, req, results, errors);
                }
            }
        });
        process.metas_phase.register(local_id, local, reduce);

        let local: LocalAction<VerificationRequest, CheckResponse> = Arc::new({
            let weak = weak.clone();
            move |req: VerificationRequest| -> BoxFuture<'static, Result<Option<CheckResponse>>> {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(process) => process.validate_parts(req).await,
                        None => Ok(None),
                    }
                }
                .boxed()
            }
        });
        let reduce: ReduceAction<VerificationRequest, CheckResponse> = Arc::new({
            let weak = weak.clone();
            move |id: Uuid,
                  req: VerificationRequest,
                  results: PhaseResults<CheckResponse>,
                  errors: PhaseErrors| {
                if let Some(process) = weak.upgrade() {
                    process.reduce_parts(id, req, results, errors);
                }
            }
        });
        process.parts_phase.register(local_id, local, reduce);

        let listener = spawn_listener(weak, events);
        *process
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);

        process
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Check snapshot `name` across the cluster.
    ///
    /// The check starts right away; the returned future resolves with the
    /// report, or with the error that aborted the check.
    pub fn verify_snapshot(
        &self,
        name: &str,
        options: CheckOptions,
    ) -> BoxFuture<'static, Result<ConflictReport>> {
        match self.start_check(name, options) {
            Ok(op) => async move { op.wait().await }.boxed(),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    fn start_check(
        &self,
        name: &str,
        options: CheckOptions,
    ) -> Result<Arc<Completion<Result<ConflictReport>>>> {
        validate_snapshot_name(name)?;

        let mut nodes: BTreeSet<NodeId> = self
            .topology
            .alive_baseline_nodes()
            .into_iter()
            .map(|n| n.id)
            .collect();
        nodes.insert(self.local_id);

        let request = VerificationRequest::new(Uuid::new_v4(), nodes, name, options);
        strategy::validate(&request)?;

        // Same-node conflicts are reported to the caller right away.
        self.registry.begin_or_reuse(&request)?;
        let op = self.cluster_ops.register(request.request_id());

        tracing::info!("Starting snapshot validation [{}]", request);
        self.metas_phase.start(request.request_id(), request);
        Ok(op)
    }

    fn local_node(&self) -> ClusterNode {
        self.topology.lookup(self.local_id)
    }

    /// First phase, on every node: read the local snapshot metadata.
    async fn prepare_and_check_metas(
        &self,
        req: VerificationRequest,
    ) -> Result<Option<Vec<SnapshotMetadata>>> {
        if !req.nodes().contains(&self.local_id) {
            return Ok(None);
        }

        let ctx = self.registry.begin_or_reuse(&req)?;

        // Nodes outside the baseline hold no snapshot data.
        if !self.topology.is_baseline(self.local_id) {
            return Ok(None);
        }

        let dir = self.storage.snapshot_dir(req.snapshot_name(), req.snapshot_path());
        let cons = self.local_node().consistent_id;
        let metas = ctx
            .run(self.storage.read_local_metas(&dir, req.incremental_index(), req.groups(), &cons))
            .await?;

        tracing::debug!(
            "Snapshot metadata read [snapshot={}, consId={}, instances={}]",
            req.snapshot_name(),
            cons,
            metas.len()
        );
        Ok(Some(metas))
    }

    /// First phase reduction, on every node.
    fn reduce_metas(
        &self,
        request_id: Uuid,
        req: VerificationRequest,
        results: PhaseResults<Vec<SnapshotMetadata>>,
        errors: PhaseErrors,
    ) {
        self.check_required_nodes(&req);
        let ctx = self.registry.get(&req);

        if let Some(err) = ctx.as_ref().and_then(|c| c.failure()) {
            self.finish(&req, Err(err));
            return;
        }

        if !errors.is_empty() {
            let errors = errors
                .into_iter()
                .map(|(id, e)| (self.topology.lookup(id), e))
                .collect();
            self.finish(&req, Err(Error::verify(errors)));
            return;
        }

        let cluster_metas: BTreeMap<ClusterNode, Vec<SnapshotMetadata>> = results
            .into_iter()
            .filter(|(id, _)| req.nodes().contains(id))
            .filter_map(|(id, metas)| metas.map(|m| (self.topology.lookup(id), m)))
            .filter(|(_, metas)| !metas.is_empty())
            .collect();

        let local = self.local_node();
        let failures = reduce_metas_results(req.snapshot_name(), &cluster_metas, &local);
        if !failures.is_empty() {
            self.finish(&req, Err(Error::verify(failures)));
            return;
        }

        if let Some(ctx) = &ctx {
            let assigned = assign_metas_to_work(&cluster_metas, &local);
            tracing::debug!(
                "Snapshot instances assigned [reqId={}, consId={}, instances={:?}]",
                request_id,
                local.consistent_id,
                assigned.iter().map(|m| m.consistent_id.as_str()).collect::<Vec<_>>()
            );
            ctx.set_assigned(assigned);
            if self.cluster_ops.contains(request_id) {
                ctx.set_cluster_metas(cluster_metas);
            }
        }

        if self.topology.is_coordinator(self.local_id) {
            self.parts_phase.start(request_id, req);
        }
    }

    /// Second phase, on every node: check the assigned instances.
    async fn validate_parts(&self, req: VerificationRequest) -> Result<Option<CheckResponse>> {
        if !req.nodes().contains(&self.local_id) {
            return Ok(None);
        }

        let Some(ctx) = self.registry.get(&req) else {
            return Ok(None);
        };
        if let Some(err) = ctx.failure() {
            return Err(err);
        }

        let metas = ctx.assigned();
        if metas.is_empty() {
            return Ok(None);
        }

        let strategy = CheckStrategy::for_request(&req);
        tracing::info!(
            "Checking snapshot instances [snapshot={}, strategy={}, instances={}]",
            req.snapshot_name(),
            strategy,
            metas.len()
        );

        let dir = self.storage.snapshot_dir(req.snapshot_name(), req.snapshot_path());
        let response = ctx
            .run(strategy.check(&req, metas, dir, self.storage.clone(), self.handlers.clone()))
            .await?;
        Ok(Some(response))
    }

    /// Second phase reduction, on every node.
    fn reduce_parts(
        &self,
        request_id: Uuid,
        req: VerificationRequest,
        results: PhaseResults<CheckResponse>,
        errors: PhaseErrors,
    ) {
        self.check_required_nodes(&req);
        let ctx = self.registry.remove(req.snapshot_name(), request_id);

        if !self.cluster_ops.contains(request_id) {
            return;
        }

        if let Some(err) = ctx.as_ref().and_then(|c| c.failure()) {
            self.cluster_ops.complete(request_id, Err(err));
            return;
        }

        let outcome = match CheckStrategy::for_request(&req) {
            CheckStrategy::Incremental { .. } => {
                reducer::reduce_incremental(&self.topology, results, errors)
            }
            CheckStrategy::CustomHandlers => reducer::reduce_custom_handlers(
                &self.topology,
                &self.handlers,
                req.snapshot_name(),
                results,
                errors,
            ),
            CheckStrategy::PartitionHashes { .. } => {
                reducer::reduce_partition_hashes(&self.topology, results, errors)
            }
        };

        let outcome = outcome.map(|mut report| {
            if let Some(ctx) = &ctx {
                report.cluster_metas = ctx.take_cluster_metas();
            }
            report
        });
        self.cluster_ops.complete(request_id, outcome);
    }

    /// End a check that did not reach the second phase.
    fn finish(&self, req: &VerificationRequest, outcome: Result<ConflictReport>) {
        self.registry.remove(req.snapshot_name(), req.request_id());
        self.cluster_ops.complete(req.request_id(), outcome);
    }

    /// A departure may reach the reduction before the membership listener.
    fn check_required_nodes(&self, req: &VerificationRequest) {
        let gone: Vec<NodeId> = req
            .nodes()
            .iter()
            .copied()
            .filter(|id| !self.topology.is_alive(*id))
            .collect();
        for id in gone {
            self.on_node_left(id);
        }
    }

    pub(crate) fn on_node_left(&self, left: NodeId) {
        handle_node_left(self.local_id, left, &self.registry, &self.cluster_ops);
    }

    /// Departures may have been missed; check every running check's nodes.
    pub(crate) fn on_events_lost(&self) {
        let gone: BTreeSet<NodeId> = self
            .registry
            .contexts()
            .iter()
            .flat_map(|ctx| ctx.request().nodes().iter().copied())
            .filter(|id| !self.topology.is_alive(*id))
            .collect();
        for id in gone {
            self.on_node_left(id);
        }
    }

    /// Stop the process: running checks fail and new ones are refused.
    pub fn stop(&self) {
        let err = Error::NodeStopping(self.local_id);
        let contexts = self.registry.stop();
        for ctx in &contexts {
            ctx.fail(err.clone());
        }
        self.cluster_ops.fail_all(&err);

        self.metas_phase.deregister(self.local_id);
        self.parts_phase.deregister(self.local_id);
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }

        tracing::info!(
            "Snapshot check process stopped [nodeId={}, interrupted={}]",
            self.local_id,
            contexts.len()
        );
    }

    pub fn is_stopping(&self) -> bool {
        self.registry.is_stopping()
    }

    /// Is a check of `snapshot` running on this node?
    pub fn has_context(&self, snapshot: &str) -> bool {
        self.registry.contains(snapshot)
    }

    /// Snapshots with a running check on this node
    pub fn active_checks(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .contexts()
            .iter()
            .map(|ctx| ctx.request().snapshot_name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Checks started here still waiting for their report
    pub fn pending_operations(&self) -> usize {
        self.cluster_ops.len()
    }
}

impl Drop for SnapshotCheckProcess {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}
