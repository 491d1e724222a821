//! A cluster of snapshot check processes inside one process
//!
//! Every node shares the topology and both phases, and reads snapshots
//! from its own work directory.

use crate::cluster::{ClusterNode, InProcessPhase, NodeId, PhaseKind, Topology};
use crate::common::StorageConfig;
use crate::ops::generate::node_dir;
use crate::snapshot::{FsSnapshotStorage, HandlerRegistry, SnapshotMetadata, SnapshotStorage};
use crate::verify::{CheckResponse, MetasPhase, PartsPhase, SnapshotCheckProcess, VerificationRequest};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub struct LocalCluster {
    work_dir: PathBuf,
    config: StorageConfig,
    topology: Topology,
    metas_phase: Arc<InProcessPhase<VerificationRequest, Vec<SnapshotMetadata>>>,
    parts_phase: Arc<InProcessPhase<VerificationRequest, CheckResponse>>,
    handlers: HandlerRegistry,
    processes: Mutex<BTreeMap<NodeId, Arc<SnapshotCheckProcess>>>,
}

impl LocalCluster {
    pub fn new(work_dir: impl Into<PathBuf>, config: StorageConfig) -> Self {
        let topology = Topology::new();
        Self {
            work_dir: work_dir.into(),
            config,
            metas_phase: Arc::new(InProcessPhase::new(PhaseKind::CheckMetas, topology.clone())),
            parts_phase: Arc::new(InProcessPhase::new(PhaseKind::CheckParts, topology.clone())),
            topology,
            handlers: HandlerRegistry::default(),
            processes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Handlers every node started afterwards runs
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn processes(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, Arc<SnapshotCheckProcess>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a node reading from `<work dir>/<consistent id>`.
    pub fn start_node(&self, consistent_id: &str, baseline: bool) -> Arc<SnapshotCheckProcess> {
        let storage = FsSnapshotStorage::new(node_dir(&self.work_dir, consistent_id), self.config.clone());
        self.start_node_with_storage(consistent_id, baseline, Arc::new(storage))
    }

    /// Join a node backed by `storage`.
    pub fn start_node_with_storage(
        &self,
        consistent_id: &str,
        baseline: bool,
        storage: Arc<dyn SnapshotStorage>,
    ) -> Arc<SnapshotCheckProcess> {
        let node = self.topology.join(consistent_id, baseline);
        let metas_phase: MetasPhase = self.metas_phase.clone();
        let parts_phase: PartsPhase = self.parts_phase.clone();

        let process = SnapshotCheckProcess::new(
            node.id,
            self.topology.clone(),
            storage,
            self.handlers.clone(),
            metas_phase,
            parts_phase,
        );
        self.processes().insert(node.id, process.clone());
        process
    }

    /// Graceful stop: the node leaves, then its running checks are interrupted.
    ///
    /// Leaving first keeps a deregistered node from being picked as coordinator.
    pub fn stop_node(&self, id: NodeId) -> bool {
        let Some(process) = self.processes().remove(&id) else {
            return false;
        };
        self.topology.leave(id);
        process.stop();
        true
    }

    /// Abrupt departure
    pub fn fail_node(&self, id: NodeId) -> bool {
        let Some(process) = self.processes().remove(&id) else {
            return false;
        };
        self.topology.fail(id);
        process.stop();
        true
    }

    pub fn process(&self, id: NodeId) -> Option<Arc<SnapshotCheckProcess>> {
        self.processes().get(&id).cloned()
    }

    /// Alive nodes in join order
    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.topology.alive_nodes()
    }

    /// Process of the oldest alive node
    pub fn coordinator(&self) -> Option<Arc<SnapshotCheckProcess>> {
        self.topology.coordinator().and_then(|c| self.process(c.id))
    }

    /// Stop every node, youngest first.
    pub fn shutdown(&self) {
        let mut ids: Vec<NodeId> = self.nodes().into_iter().map(|n| n.id).collect();
        ids.reverse();
        for id in ids {
            self.stop_node(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_nodes_join_and_leave() {
        let dir = tempdir().unwrap();
        let cluster = LocalCluster::new(dir.path(), StorageConfig::default());

        let a = cluster.start_node("a", true);
        let b = cluster.start_node("b", true);
        assert_eq!(cluster.nodes().len(), 2);
        assert_eq!(cluster.coordinator().unwrap().local_id(), a.local_id());

        assert!(cluster.stop_node(a.local_id()));
        assert!(a.is_stopping());
        assert!(!cluster.stop_node(a.local_id()));
        assert_eq!(cluster.coordinator().unwrap().local_id(), b.local_id());

        assert!(cluster.fail_node(b.local_id()));
        assert!(cluster.nodes().is_empty());
    }
}
