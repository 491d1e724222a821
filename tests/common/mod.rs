//! Shared fixtures for snapverify integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use snapverify::common::{encode_name, StorageConfig};
use snapverify::ops::{generate_snapshot, node_dir, GenerateOptions, LocalCluster};
use snapverify::snapshot::partition::{
    cache_dir_name, partition_file_name, scan_partition, write_partition, HEADER_LEN,
    UPDATE_COUNTER_OFFSET,
};
use snapverify::snapshot::storage::DB_DIR;
use snapverify::snapshot::{
    FsSnapshotStorage, IncrementalCheckResult, PartitionHashRecord, PartitionKey, SnapshotMetadata,
    SnapshotStorage,
};
use snapverify::{ConflictReport, Result, SnapshotCheckProcess};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const SNAPSHOT: &str = "snp";
pub const NODES: [&str; 3] = ["node-a", "node-b", "node-c"];
pub const WAIT: Duration = Duration::from_secs(10);

pub fn config() -> StorageConfig {
    StorageConfig {
        page_size: 256,
        ..Default::default()
    }
}

pub fn options(name: &str) -> GenerateOptions {
    GenerateOptions {
        name: name.into(),
        nodes: NODES.iter().map(|n| n.to_string()).collect(),
        groups: vec!["accounts".into(), "orders".into()],
        partitions: 8,
        backups: 1,
        keys: 200,
        increments: 0,
        txs_per_increment: 16,
    }
}

/// A generated three-node snapshot in a fresh work directory
pub fn generated(opts: GenerateOptions) -> TempDir {
    let dir = TempDir::new().unwrap();
    generate_snapshot(dir.path(), &config(), &opts).unwrap();
    dir
}

/// Start every node of `NODES` as a baseline node.
pub fn start_all(cluster: &LocalCluster) -> Vec<Arc<SnapshotCheckProcess>> {
    NODES.iter().map(|n| cluster.start_node(n, true)).collect()
}

pub fn snapshot_dir(work_dir: &Path, cons: &str, name: &str) -> PathBuf {
    FsSnapshotStorage::new(node_dir(work_dir, cons), config()).snapshot_dir(name, None)
}

pub fn read_meta(work_dir: &Path, cons: &str, name: &str) -> SnapshotMetadata {
    SnapshotMetadata::read(&snapshot_dir(work_dir, cons, name).join(SnapshotMetadata::file_name(cons)))
        .unwrap()
}

/// Some partition stored by `cons`: (group name, partition, file)
pub fn held_partition(work_dir: &Path, cons: &str, name: &str) -> (String, u32, PathBuf) {
    let meta = read_meta(work_dir, cons, name);
    let (grp_id, parts) = meta.partitions.iter().next().unwrap();
    let group = meta.cache_groups[grp_id].clone();
    let part = *parts.iter().next().unwrap();
    let path = partition_path(work_dir, cons, name, &group, part);
    (group, part, path)
}

pub fn partition_path(work_dir: &Path, cons: &str, name: &str, group: &str, part: u32) -> PathBuf {
    snapshot_dir(work_dir, cons, name)
        .join(DB_DIR)
        .join(encode_name(cons))
        .join(cache_dir_name(group))
        .join(partition_file_name(part))
}

/// Flip a byte inside the first page; the header stays valid.
pub fn corrupt_page(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[HEADER_LEN + 4] ^= 0xFF;
    std::fs::write(path, bytes).unwrap();
}

/// Raise the update counter, keeping the header checksum valid.
pub fn bump_update_counter(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    let range = UPDATE_COUNTER_OFFSET..UPDATE_COUNTER_OFFSET + 8;
    let counter = u64::from_le_bytes(bytes[range.clone()].try_into().unwrap());
    bytes[range].copy_from_slice(&(counter + 1).to_le_bytes());

    let crc = crc32fast::hash(&bytes[4..HEADER_LEN - 4]);
    bytes[HEADER_LEN - 4..HEADER_LEN].copy_from_slice(&crc.to_le_bytes());
    std::fs::write(path, bytes).unwrap();
}

/// Rewrite a partition with other content but the same header fields.
pub fn rewrite_content(path: &Path) {
    let header = scan_partition(path, false).unwrap().header;
    write_partition(
        path,
        header.group_id,
        header.partition,
        header.update_counter,
        header.primary,
        &[(b"forged-key".to_vec(), b"forged-value".to_vec())],
        256,
    )
    .unwrap();
}

pub fn copy_dir(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// Poll `cond` until it holds or `WAIT` passes.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub async fn finished(
    check: impl std::future::Future<Output = Result<ConflictReport>>,
) -> Result<ConflictReport> {
    tokio::time::timeout(WAIT, check)
        .await
        .expect("snapshot check did not finish")
}

/// Where a [`GatedStorage`] holds work back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePoint {
    Metas,
    Partitions,
}

/// Filesystem storage that blocks at one point until opened.
pub struct GatedStorage {
    inner: FsSnapshotStorage,
    point: GatePoint,
    gate: Arc<Semaphore>,
    entered: Arc<AtomicUsize>,
}

impl GatedStorage {
    pub fn new(root: PathBuf, point: GatePoint, gate: Arc<Semaphore>, entered: Arc<AtomicUsize>) -> Self {
        Self {
            inner: FsSnapshotStorage::new(root, config()),
            point,
            gate,
            entered,
        }
    }

    async fn pass(&self, point: GatePoint) {
        if point != self.point {
            return;
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        // A closed semaphore lets everybody through.
        let _ = self.gate.acquire().await;
    }
}

#[async_trait]
impl SnapshotStorage for GatedStorage {
    fn snapshot_dir(&self, name: &str, path: Option<&Path>) -> PathBuf {
        self.inner.snapshot_dir(name, path)
    }

    async fn read_local_metas(
        &self,
        snapshot_dir: &Path,
        incremental_index: i32,
        groups: Option<&BTreeSet<String>>,
        consistent_id: &str,
    ) -> Result<Vec<SnapshotMetadata>> {
        self.pass(GatePoint::Metas).await;
        self.inner
            .read_local_metas(snapshot_dir, incremental_index, groups, consistent_id)
            .await
    }

    async fn check_partitions(
        &self,
        meta: &SnapshotMetadata,
        snapshot_dir: &Path,
        groups: Option<&BTreeSet<String>>,
        full_check: bool,
    ) -> Result<BTreeMap<PartitionKey, PartitionHashRecord>> {
        self.pass(GatePoint::Partitions).await;
        self.inner
            .check_partitions(meta, snapshot_dir, groups, full_check)
            .await
    }

    async fn check_incremental(
        &self,
        meta: &SnapshotMetadata,
        snapshot_dir: &Path,
        index: i32,
    ) -> Result<IncrementalCheckResult> {
        self.inner.check_incremental(meta, snapshot_dir, index).await
    }
}

/// A cluster whose nodes all hold back at `point`
pub struct GatedCluster {
    pub cluster: LocalCluster,
    pub nodes: Vec<Arc<SnapshotCheckProcess>>,
    gate: Arc<Semaphore>,
    entered: Arc<AtomicUsize>,
}

impl GatedCluster {
    pub fn start(work_dir: &Path, point: GatePoint) -> Self {
        Self::build(work_dir, point, None)
    }

    /// Same cluster behind a non-baseline node `client` that joins first and coordinates.
    pub fn start_behind(work_dir: &Path, point: GatePoint, client: &str) -> (Self, Arc<SnapshotCheckProcess>) {
        let gated = Self::build(work_dir, point, Some(client));
        let client = gated.cluster.coordinator().unwrap();
        (gated, client)
    }

    fn build(work_dir: &Path, point: GatePoint, client: Option<&str>) -> Self {
        let cluster = LocalCluster::new(work_dir, config());
        if let Some(name) = client {
            cluster.start_node(name, false);
        }
        let gate = Arc::new(Semaphore::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let nodes = NODES
            .iter()
            .map(|n| {
                let storage =
                    GatedStorage::new(node_dir(work_dir, n), point, gate.clone(), entered.clone());
                cluster.start_node_with_storage(n, true, Arc::new(storage))
            })
            .collect();

        Self {
            cluster,
            nodes,
            gate,
            entered,
        }
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.gate.close();
    }
}
