//! Cross-node checks of snapshot check results
//!
//! Pure functions over what the nodes reported; the verification process
//! decides which of them to run and when.

use crate::cluster::ClusterNode;
use crate::common::Error;
use crate::snapshot::incremental::IncrementalCheckResult;
use crate::snapshot::metadata::SnapshotMetadata;
use crate::snapshot::partition::{PartitionHashRecord, PartitionKey};
use crate::snapshot::report::{ConflictReport, TxHashConflict};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Check that the metadata reported by the nodes describes one complete snapshot.
///
/// Returns the failures per node; empty when consistent.
pub fn reduce_metas_results(
    snapshot_name: &str,
    metas: &BTreeMap<ClusterNode, Vec<SnapshotMetadata>>,
    local: &ClusterNode,
) -> BTreeMap<ClusterNode, Error> {
    let mut errors = BTreeMap::new();

    let Some(reference) = metas.values().flatten().next() else {
        errors.insert(local.clone(), Error::NotFound(snapshot_name.to_string()));
        return errors;
    };

    for (node, node_metas) in metas {
        if let Some(other) = node_metas.iter().find(|m| !reference.same_snapshot(m)) {
            errors.insert(
                node.clone(),
                Error::MetadataMismatch(format!(
                    "[snapshot={}, consId={}, reqId={}, expectedReqId={}]",
                    snapshot_name, other.consistent_id, other.request_id, reference.request_id
                )),
            );
        }
    }

    if !errors.is_empty() {
        return errors;
    }

    let found: BTreeSet<&String> = metas.values().flatten().map(|m| &m.consistent_id).collect();
    let missing: BTreeSet<String> = reference
        .baseline_nodes
        .iter()
        .filter(|cons| !found.contains(cons))
        .cloned()
        .collect();

    if !missing.is_empty() {
        errors.insert(local.clone(), Error::MissingMetadata(missing));
    }

    errors
}

/// Do the replicas of one partition disagree on (update counter, content)?
/// Content is only compared between replicas that were hashed.
pub fn partition_conflicts(records: &[PartitionHashRecord]) -> (bool, bool) {
    let counters: BTreeSet<u64> = records.iter().map(|r| r.update_counter).collect();
    let hashes: BTreeSet<&String> = records.iter().filter_map(|r| r.hash.as_ref()).collect();
    (counters.len() > 1, hashes.len() > 1)
}

/// Classify partition replica discrepancies.
pub fn reduce_hashes_results(
    results: BTreeMap<ClusterNode, BTreeMap<PartitionKey, Vec<PartitionHashRecord>>>,
    exceptions: BTreeMap<ClusterNode, Error>,
) -> ConflictReport {
    let mut partitions: BTreeMap<PartitionKey, Vec<PartitionHashRecord>> = BTreeMap::new();
    for node_records in results.into_values() {
        for (key, records) in node_records {
            partitions.entry(key).or_default().extend(records);
        }
    }

    let mut report = ConflictReport::from_exceptions(exceptions);

    for (key, records) in &partitions {
        let (counter_conflict, hash_conflict) = partition_conflicts(records);
        if counter_conflict {
            report.counter_conflicts.insert(key.clone(), records.clone());
        }
        if hash_conflict {
            report.hash_conflicts.insert(key.clone(), records.clone());
        }
    }

    report.partitions = partitions;
    report
}

/// Classify incremental snapshot discrepancies.
pub fn reduce_incremental_results(
    results: BTreeMap<ClusterNode, Vec<IncrementalCheckResult>>,
    exceptions: BTreeMap<ClusterNode, Error>,
) -> ConflictReport {
    let mut report = ConflictReport::from_exceptions(exceptions);

    let by_cons: HashMap<&str, &IncrementalCheckResult> = results
        .values()
        .flatten()
        .map(|r| (r.consistent_id.as_str(), r))
        .collect();

    for (node, node_results) in &results {
        let partial: BTreeSet<u64> = node_results
            .iter()
            .flat_map(|r| r.partially_committed.iter().copied())
            .collect();
        if !partial.is_empty() {
            report.partially_committed_txs.insert(node.clone(), partial);
        }
    }

    let mut local_ids: Vec<&&str> = by_cons.keys().collect();
    local_ids.sort();

    for local_id in local_ids {
        let local = by_cons[*local_id];
        for (remote_id, local_hash) in &local.tx_hashes {
            // Nothing to compare against when the remote instance was not checked.
            let Some(remote) = by_cons.get(remote_id.as_str()) else {
                continue;
            };
            let remote_hash = remote.tx_hashes.get(&local.consistent_id).copied();
            if remote_hash == Some(*local_hash) {
                continue;
            }
            // Reported once per pair.
            if remote_hash.is_some() && remote_id.as_str() < *local_id {
                continue;
            }

            report.tx_hash_conflicts.push(TxHashConflict {
                local_consistent_id: local.consistent_id.clone(),
                remote_consistent_id: remote_id.clone(),
                local_hash: *local_hash,
                remote_hash,
            });
        }
    }

    report
}
