//! Snapshot storage access used by the verification process
//!
//! Layout of one node's snapshot directory:
//! ```text
//! <name>/
//!   <consistent id>.smf
//!   db/<folder>/cache-<group>/part-<n>.bin
//!   increments/<index>/<consistent id>.inc
//! ```

use crate::common::{encode_name, Error, Result, StorageConfig};
use crate::snapshot::incremental::{self, IncrementalCheckResult};
use crate::snapshot::metadata::SnapshotMetadata;
use crate::snapshot::partition::{
    cache_dir_name, partition_file_name, scan_partition, PartitionHashRecord, PartitionKey,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Directory holding instance data inside a snapshot directory
pub const DB_DIR: &str = "db";

/// Reads snapshot artifacts stored on one node.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Directory of snapshot `name`; `path` overrides the configured location.
    fn snapshot_dir(&self, name: &str, path: Option<&Path>) -> PathBuf;

    /// Metadata of every instance stored locally, the instance of
    /// `consistent_id` first.
    async fn read_local_metas(
        &self,
        snapshot_dir: &Path,
        incremental_index: i32,
        groups: Option<&BTreeSet<String>>,
        consistent_id: &str,
    ) -> Result<Vec<SnapshotMetadata>>;

    /// Partition hash records of one instance.
    async fn check_partitions(
        &self,
        meta: &SnapshotMetadata,
        snapshot_dir: &Path,
        groups: Option<&BTreeSet<String>>,
        full_check: bool,
    ) -> Result<BTreeMap<PartitionKey, PartitionHashRecord>>;

    /// Replay the incremental segments of one instance.
    async fn check_incremental(
        &self,
        meta: &SnapshotMetadata,
        snapshot_dir: &Path,
        index: i32,
    ) -> Result<IncrementalCheckResult>;
}

/// Snapshot storage on the local filesystem
pub struct FsSnapshotStorage {
    root: PathBuf,
    config: StorageConfig,
    io_permits: Arc<Semaphore>,
}

impl FsSnapshotStorage {
    pub fn new(root: impl Into<PathBuf>, config: StorageConfig) -> Self {
        let io_permits = Arc::new(Semaphore::new(config.parallelism.max(1)));
        Self {
            root: root.into(),
            config,
            io_permits,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Data directory of one instance
    pub fn instance_dir(snapshot_dir: &Path, meta: &SnapshotMetadata) -> PathBuf {
        snapshot_dir.join(DB_DIR).join(&meta.folder_name)
    }

    /// Group ids of `meta` selected by `groups`; all groups of the instance when unset.
    fn selected_groups(meta: &SnapshotMetadata, groups: Option<&BTreeSet<String>>) -> BTreeSet<i32> {
        match groups {
            Some(names) => meta.resolve_groups(names).0,
            None => meta.cache_groups.keys().copied().collect(),
        }
    }
}

#[async_trait]
impl SnapshotStorage for FsSnapshotStorage {
    fn snapshot_dir(&self, name: &str, path: Option<&Path>) -> PathBuf {
        match path {
            Some(path) => path.join(encode_name(name)),
            None => self.root.join(&self.config.snapshot_dir).join(encode_name(name)),
        }
    }

    async fn read_local_metas(
        &self,
        snapshot_dir: &Path,
        incremental_index: i32,
        groups: Option<&BTreeSet<String>>,
        consistent_id: &str,
    ) -> Result<Vec<SnapshotMetadata>> {
        let dir = snapshot_dir.to_path_buf();
        let mut metas =
            tokio::task::spawn_blocking(move || SnapshotMetadata::read_all(&dir)).await??;

        let Some(first) = metas.first() else {
            return Ok(metas);
        };
        let snapshot = first.snapshot_name.clone();

        if let Some(names) = groups {
            let missing: BTreeSet<String> = names
                .iter()
                .filter(|n| !metas.iter().any(|m| m.cache_groups.values().any(|g| g == *n)))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(Error::CacheGroupsNotFound {
                    snapshot,
                    groups: missing,
                });
            }
        }

        if incremental_index > 0 {
            for meta in &metas {
                let segment =
                    incremental::segment_path(snapshot_dir, incremental_index, &meta.consistent_id);
                if !segment.is_file() {
                    return Err(Error::IncrementalNotFound {
                        snapshot,
                        index: incremental_index,
                        consistent_id: meta.consistent_id.clone(),
                    });
                }
            }
        }

        // Stable: the rest stays ordered by consistent id.
        metas.sort_by_key(|m| m.consistent_id != consistent_id);
        Ok(metas)
    }

    async fn check_partitions(
        &self,
        meta: &SnapshotMetadata,
        snapshot_dir: &Path,
        groups: Option<&BTreeSet<String>>,
        full_check: bool,
    ) -> Result<BTreeMap<PartitionKey, PartitionHashRecord>> {
        let instance_dir = Self::instance_dir(snapshot_dir, meta);
        let selected = Self::selected_groups(meta, groups);

        let mut groups_to_check = Vec::new();
        let mut missing_groups = BTreeSet::new();
        for group_id in &selected {
            let Some(parts) = meta.partitions.get(group_id) else {
                continue;
            };
            let name = meta.cache_groups.get(group_id).cloned().unwrap_or_default();
            let group_dir = instance_dir.join(cache_dir_name(&name));
            if group_dir.is_dir() {
                groups_to_check.push((*group_id, name, group_dir, parts));
            } else {
                missing_groups.insert(name);
            }
        }

        if !missing_groups.is_empty() {
            return Err(Error::MissingCacheGroups {
                snapshot: meta.snapshot_name.clone(),
                consistent_id: meta.consistent_id.clone(),
                groups: missing_groups,
            });
        }

        let mut files = Vec::new();
        for (group_id, name, group_dir, parts) in groups_to_check {
            let mut missed = BTreeSet::new();
            for part in parts {
                let path = group_dir.join(partition_file_name(*part));
                if !path.is_file() {
                    missed.insert(*part);
                    continue;
                }
                let key = PartitionKey {
                    group_id,
                    group_name: name.clone(),
                    partition_id: *part,
                };
                files.push((key, path));
            }

            if !missed.is_empty() {
                return Err(Error::MissingPartitions {
                    snapshot: meta.snapshot_name.clone(),
                    consistent_id: meta.consistent_id.clone(),
                    group_id,
                    missed,
                });
            }
        }

        tracing::debug!(
            "Checking partitions [snapshot={}, consId={}, parts={}, full={}]",
            meta.snapshot_name,
            meta.consistent_id,
            files.len(),
            full_check
        );

        let scans = join_all(files.into_iter().map(|(key, path)| {
            let permits = self.io_permits.clone();
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("partition reader closed".into()))?;
                let scan =
                    tokio::task::spawn_blocking(move || scan_partition(&path, full_check)).await??;
                Ok::<_, Error>((key, scan))
            }
        }))
        .await;

        let mut records = BTreeMap::new();
        for scan in scans {
            let (key, scan) = scan?;
            if scan.header.group_id != key.group_id || scan.header.partition != key.partition_id {
                return Err(Error::Corrupted(format!(
                    "partition file header does not match its location [{}]",
                    key
                )));
            }

            let record = PartitionHashRecord {
                key: key.clone(),
                consistent_id: meta.consistent_id.clone(),
                primary: scan.header.primary,
                update_counter: scan.header.update_counter,
                size: scan.header.entries,
                hash: scan.hash,
            };
            records.insert(key, record);
        }

        Ok(records)
    }

    async fn check_incremental(
        &self,
        meta: &SnapshotMetadata,
        snapshot_dir: &Path,
        index: i32,
    ) -> Result<IncrementalCheckResult> {
        let name = meta.snapshot_name.clone();
        let cons = meta.consistent_id.clone();
        let dir = snapshot_dir.to_path_buf();

        tokio::task::spawn_blocking(move || incremental::check_segments(&name, &dir, &cons, index))
            .await?
    }
}
