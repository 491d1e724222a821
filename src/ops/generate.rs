//! Synthetic replicated snapshots
//!
//! Writes one snapshot instance per node under `<work dir>/<consistent id>/`,
//! the layout a [`LocalCluster`](crate::ops::LocalCluster) node reads from.
//! Partition replicas are placed with HRW hashing, the first replica being
//! the primary.

use crate::common::{
    encode_name, group_id, partition_for_key, select_replicas, validate_snapshot_name, Error,
    Result, StorageConfig,
};
use crate::snapshot::incremental::{segment_path, write_segment};
use crate::snapshot::partition::{cache_dir_name, partition_file_name, write_partition};
use crate::snapshot::storage::DB_DIR;
use crate::snapshot::{FsSnapshotStorage, SnapshotMetadata, SnapshotStorage, TxRecord, TxState};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What to generate
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub name: String,
    /// Consistent ids of the nodes holding the snapshot
    pub nodes: Vec<String>,
    pub groups: Vec<String>,
    pub partitions: u32,
    /// Copies of each partition besides the primary
    pub backups: usize,
    /// Keys per cache group
    pub keys: usize,
    /// Number of incremental snapshots on top of the full one
    pub increments: i32,
    pub txs_per_increment: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            name: "snapshot".into(),
            nodes: vec!["node-1".into(), "node-2".into(), "node-3".into()],
            groups: vec!["default".into()],
            partitions: 16,
            backups: 1,
            keys: 1000,
            increments: 0,
            txs_per_increment: 32,
        }
    }
}

/// What was written
#[derive(Debug, Clone, Default)]
pub struct GenerateReport {
    pub instances: usize,
    pub partition_files: usize,
    pub bytes_written: u64,
    pub segments: usize,
}

/// Work directory of a node inside a cluster work directory
pub fn node_dir(work_dir: &Path, consistent_id: &str) -> PathBuf {
    work_dir.join(encode_name(consistent_id))
}

/// Owners of every partition of a group, primary first
fn placement(group: &str, partitions: u32, nodes: &[String], copies: usize) -> BTreeMap<u32, Vec<String>> {
    (0..partitions)
        .map(|p| (p, select_replicas(&format!("{}/{}", group, p), nodes, copies)))
        .collect()
}

/// Generate snapshot `options.name` for every node in `options.nodes`.
pub fn generate_snapshot(
    work_dir: &Path,
    config: &StorageConfig,
    options: &GenerateOptions,
) -> Result<GenerateReport> {
    validate_snapshot_name(&options.name)?;
    if options.nodes.is_empty() || options.groups.is_empty() {
        return Err(Error::InvalidArgument(
            "at least one node and one cache group are required".into(),
        ));
    }
    if options.partitions == 0 {
        return Err(Error::InvalidArgument("partitions must be positive".into()));
    }

    let copies = (options.backups + 1).min(options.nodes.len());
    let request_id = Uuid::new_v4();
    let created_at = Utc::now();
    let baseline: BTreeSet<String> = options.nodes.iter().cloned().collect();

    let cache_groups: BTreeMap<i32, String> = options
        .groups
        .iter()
        .map(|g| (group_id(g), g.clone()))
        .collect();
    if cache_groups.len() != options.groups.len() {
        return Err(Error::InvalidArgument("duplicate cache group names".into()));
    }

    let mut report = GenerateReport::default();

    for (grp_id, group) in &cache_groups {
        let mut entries: BTreeMap<u32, Vec<(Vec<u8>, Vec<u8>)>> = BTreeMap::new();
        for i in 0..options.keys {
            let key = format!("{}-key-{:08}", group, i).into_bytes();
            let value = format!("{}-value-{}", group, i).into_bytes();
            entries
                .entry(partition_for_key(&key, options.partitions))
                .or_default()
                .push((key, value));
        }

        for (part, owners) in placement(group, options.partitions, &options.nodes, copies) {
            let part_entries = entries.remove(&part).unwrap_or_default();
            let counter = part_entries.len() as u64;

            for (idx, owner) in owners.iter().enumerate() {
                let storage = FsSnapshotStorage::new(node_dir(work_dir, owner), config.clone());
                let snapshot_dir = storage.snapshot_dir(&options.name, None);
                let path = snapshot_dir
                    .join(DB_DIR)
                    .join(encode_name(owner))
                    .join(cache_dir_name(group))
                    .join(partition_file_name(part));

                report.bytes_written += write_partition(
                    &path,
                    *grp_id,
                    part,
                    counter,
                    idx == 0,
                    &part_entries,
                    config.page_size,
                )?;
                report.partition_files += 1;
            }
        }
    }

    for node in &options.nodes {
        let mut partitions: BTreeMap<i32, BTreeSet<u32>> = BTreeMap::new();
        for (grp_id, group) in &cache_groups {
            let held: BTreeSet<u32> = placement(group, options.partitions, &options.nodes, copies)
                .into_iter()
                .filter(|(_, owners)| owners.contains(node))
                .map(|(p, _)| p)
                .collect();
            if !held.is_empty() {
                partitions.insert(*grp_id, held);
            }
        }

        let meta = SnapshotMetadata {
            request_id,
            snapshot_name: options.name.clone(),
            consistent_id: node.clone(),
            folder_name: encode_name(node),
            page_size: config.page_size as u32,
            cache_groups: cache_groups.clone(),
            partitions,
            baseline_nodes: baseline.clone(),
            created_at,
        };

        let storage = FsSnapshotStorage::new(node_dir(work_dir, node), config.clone());
        meta.write(&storage.snapshot_dir(&options.name, None))?;
        report.instances += 1;
    }

    report.segments = generate_increments(work_dir, config, options, copies)?;

    tracing::info!(
        "Snapshot generated [name={}, nodes={}, files={}, bytes={}, segments={}]",
        options.name,
        report.instances,
        report.partition_files,
        report.bytes_written,
        report.segments
    );
    Ok(report)
}

/// Every node gets a segment per index, listing the committed transactions it took part in.
fn generate_increments(
    work_dir: &Path,
    config: &StorageConfig,
    options: &GenerateOptions,
    copies: usize,
) -> Result<usize> {
    let mut segments = 0;

    for index in 1..=options.increments {
        let mut per_node: BTreeMap<&str, Vec<TxRecord>> =
            options.nodes.iter().map(|n| (n.as_str(), Vec::new())).collect();

        for t in 0..options.txs_per_increment {
            let tx_id = index as u64 * 1_000_000 + t as u64;
            let participants: BTreeSet<String> =
                select_replicas(&format!("tx-{}", tx_id), &options.nodes, copies)
                    .into_iter()
                    .collect();

            for p in &participants {
                if let Some(records) = per_node.get_mut(p.as_str()) {
                    records.push(TxRecord {
                        tx_id,
                        state: TxState::Committed,
                        participants: participants.clone(),
                    });
                }
            }
        }

        for (node, records) in per_node {
            let storage = FsSnapshotStorage::new(node_dir(work_dir, node), config.clone());
            let dir = storage.snapshot_dir(&options.name, None);
            write_segment(&segment_path(&dir, index, node), &records)?;
            segments += 1;
        }
    }

    Ok(segments)
}
