//! Conflict report produced by a snapshot check

use crate::cluster::ClusterNode;
use crate::common::Error;
use crate::snapshot::metadata::SnapshotMetadata;
use crate::snapshot::partition::{PartitionHashRecord, PartitionKey};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Transaction hashes two nodes disagree on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxHashConflict {
    pub local_consistent_id: String,
    pub remote_consistent_id: String,
    pub local_hash: u64,
    /// `None` when the remote node saw no shared transaction at all
    pub remote_hash: Option<u64>,
}

/// Result of a snapshot check
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConflictReport {
    /// Metadata each node reported in the first phase
    #[serde(serialize_with = "entries")]
    pub cluster_metas: BTreeMap<ClusterNode, Vec<SnapshotMetadata>>,

    /// Every replica record seen, per partition
    #[serde(serialize_with = "entries")]
    pub partitions: BTreeMap<PartitionKey, Vec<PartitionHashRecord>>,

    /// Partitions whose replicas disagree on the update counter
    #[serde(serialize_with = "entries")]
    pub counter_conflicts: BTreeMap<PartitionKey, Vec<PartitionHashRecord>>,

    /// Partitions whose replicas disagree on content
    #[serde(serialize_with = "entries")]
    pub hash_conflicts: BTreeMap<PartitionKey, Vec<PartitionHashRecord>>,

    /// Prepared but never committed transactions, per node
    #[serde(serialize_with = "entries")]
    pub partially_committed_txs: BTreeMap<ClusterNode, BTreeSet<u64>>,

    pub tx_hash_conflicts: Vec<TxHashConflict>,

    /// Failures attributed to nodes
    #[serde(serialize_with = "error_entries")]
    pub exceptions: BTreeMap<ClusterNode, Error>,
}

fn entries<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    K: Serialize,
    V: Serialize,
{
    serializer.collect_seq(map.iter())
}

fn error_entries<S: Serializer>(
    map: &BTreeMap<ClusterNode, Error>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(map.iter().map(|(node, err)| (node, err.to_string())))
}

impl ConflictReport {
    /// Report with only per-node failures
    pub fn from_exceptions(exceptions: BTreeMap<ClusterNode, Error>) -> Self {
        Self {
            exceptions,
            ..Default::default()
        }
    }

    pub fn has_partition_conflicts(&self) -> bool {
        !self.counter_conflicts.is_empty() || !self.hash_conflicts.is_empty()
    }

    pub fn has_tx_conflicts(&self) -> bool {
        !self.partially_committed_txs.is_empty() || !self.tx_hash_conflicts.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        self.has_partition_conflicts() || self.has_tx_conflicts()
    }

    /// Nothing conflicting and nothing failed
    pub fn is_clean(&self) -> bool {
        !self.has_conflicts() && self.exceptions.is_empty()
    }

    /// JSON rendering for tooling
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.exceptions.is_empty() {
            let n = self.exceptions.len();
            writeln!(
                f,
                "The check procedure failed on {} node{}.",
                n,
                if n == 1 { "" } else { "s" }
            )?;
            for (node, err) in &self.exceptions {
                writeln!(f, "[{}]: {}", node, err)?;
            }
        }

        if !self.has_conflicts() {
            return writeln!(f, "The check procedure has finished, no conflicts have been found.");
        }

        if self.has_partition_conflicts() {
            writeln!(
                f,
                "The check procedure has failed, conflict partitions has been found: \
                 [counterConflicts={}, hashConflicts={}]",
                self.counter_conflicts.len(),
                self.hash_conflicts.len()
            )?;
            for (title, conflicts) in [
                ("Update counter conflicts:", &self.counter_conflicts),
                ("Hash conflicts:", &self.hash_conflicts),
            ] {
                if conflicts.is_empty() {
                    continue;
                }
                writeln!(f, "{}", title)?;
                for (key, records) in conflicts {
                    writeln!(f, "Conflict partition: [{}]", key)?;
                    for record in records {
                        writeln!(f, "  {}", record)?;
                    }
                }
            }
        }

        if self.has_tx_conflicts() {
            writeln!(
                f,
                "The check procedure has failed, transaction conflicts has been found: \
                 [partiallyCommitted={}, txHashConflicts={}]",
                self.partially_committed_txs.values().map(BTreeSet::len).sum::<usize>(),
                self.tx_hash_conflicts.len()
            )?;
            for (node, txs) in &self.partially_committed_txs {
                writeln!(f, "Partially committed transactions on [{}]: {:?}", node, txs)?;
            }
            for c in &self.tx_hash_conflicts {
                writeln!(
                    f,
                    "Transaction hash conflict: [local={}, remote={}, localHash={:#018x}, remoteHash={}]",
                    c.local_consistent_id,
                    c.remote_consistent_id,
                    c.local_hash,
                    c.remote_hash
                        .map(|h| format!("{:#018x}", h))
                        .unwrap_or_else(|| "none".to_string())
                )?;
            }
        }

        Ok(())
    }
}
