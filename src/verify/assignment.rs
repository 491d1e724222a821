//! Which snapshot instances a node checks
//!
//! A snapshot may be checked on fewer nodes than took it. Instances of
//! nodes that are no longer around must still be checked, by exactly one
//! of the nodes holding a copy. Every node computes the same assignment
//! from the same first-phase results.

use crate::cluster::ClusterNode;
use crate::snapshot::SnapshotMetadata;
use std::collections::{BTreeMap, BTreeSet};

/// Instances `local` checks in the second phase.
///
/// `cluster_metas` maps every responding node to the instances it holds;
/// its ordering (join order, then node id) decides who takes an orphan.
pub fn assign_metas_to_work(
    cluster_metas: &BTreeMap<ClusterNode, Vec<SnapshotMetadata>>,
    local: &ClusterNode,
) -> Vec<SnapshotMetadata> {
    let Some(local_metas) = cluster_metas.get(local) else {
        return Vec::new();
    };

    let online: BTreeSet<&str> = cluster_metas
        .keys()
        .map(|n| n.consistent_id.as_str())
        .collect();

    // Owner of each orphaned instance: the oldest node holding it.
    let mut owners: BTreeMap<&str, &ClusterNode> = BTreeMap::new();
    for (node, metas) in cluster_metas {
        for meta in metas {
            let cons = meta.consistent_id.as_str();
            if !online.contains(cons) {
                owners.entry(cons).or_insert(node);
            }
        }
    }

    local_metas
        .iter()
        .filter(|meta| {
            meta.consistent_id == local.consistent_id
                || owners
                    .get(meta.consistent_id.as_str())
                    .is_some_and(|owner| *owner == local)
        })
        .cloned()
        .collect()
}
