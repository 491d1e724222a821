//! Reduction of second phase responses into a report

use crate::cluster::{ClusterNode, PhaseErrors, PhaseResults, Topology};
use crate::common::{Error, Result};
use crate::snapshot::{
    reduce_hashes_results, reduce_incremental_results, ConflictReport, HandlerRegistry,
    PartitionHashRecord, PartitionKey,
};
use crate::verify::response::CheckResponse;
use std::collections::BTreeMap;

fn node_errors(topology: &Topology, errors: PhaseErrors) -> BTreeMap<ClusterNode, Error> {
    errors
        .into_iter()
        .map(|(id, err)| (topology.lookup(id), err))
        .collect()
}

fn unexpected(node: &ClusterNode, response: &CheckResponse, expected: &str) -> Error {
    Error::Internal(format!(
        "unexpected {} response from [{}], expected {}",
        response.kind(),
        node,
        expected
    ))
}

/// Partition hash mode. Instance failures are reported per node; a check
/// nobody answered fails as a whole.
pub fn reduce_partition_hashes(
    topology: &Topology,
    results: PhaseResults<CheckResponse>,
    errors: PhaseErrors,
) -> Result<ConflictReport> {
    let mut exceptions = node_errors(topology, errors);
    let mut hashes: BTreeMap<ClusterNode, BTreeMap<PartitionKey, Vec<PartitionHashRecord>>> =
        BTreeMap::new();
    let mut responded = false;

    for (id, response) in results {
        let Some(response) = response else {
            continue;
        };
        responded = true;
        let node = topology.lookup(id);

        let instances = match response {
            CheckResponse::PartitionHashes(instances) => instances,
            other => return Err(unexpected(&node, &other, "partition-hashes")),
        };

        let node_hashes = hashes.entry(node.clone()).or_default();
        for records in instances.results.into_values() {
            for (key, record) in records {
                node_hashes.entry(key).or_default().push(record);
            }
        }
        if let Some((_, err)) = instances.exceptions.into_iter().next() {
            exceptions.entry(node).or_insert(err);
        }
    }

    if !responded {
        return Err(Error::verify(exceptions));
    }

    Ok(reduce_hashes_results(hashes, exceptions))
}

/// Custom handlers mode. Any failure fails the check.
pub fn reduce_custom_handlers(
    topology: &Topology,
    handlers: &HandlerRegistry,
    snapshot_name: &str,
    results: PhaseResults<CheckResponse>,
    errors: PhaseErrors,
) -> Result<ConflictReport> {
    if !errors.is_empty() {
        return Err(Error::verify(node_errors(topology, errors)));
    }

    let mut per_node = BTreeMap::new();
    for (id, response) in results {
        let Some(response) = response else {
            continue;
        };
        let node = topology.lookup(id);

        let instances = match response {
            CheckResponse::CustomHandlers(instances) => instances,
            other => return Err(unexpected(&node, &other, "custom-handlers")),
        };
        if let Some((_, err)) = instances.exceptions.into_iter().next() {
            return Err(Error::verify(BTreeMap::from([(node, err)])));
        }
        per_node.insert(node, instances.results);
    }

    if per_node.is_empty() {
        return Err(Error::verify(BTreeMap::new()));
    }

    handlers.check_results(snapshot_name, &per_node)?;
    Ok(ConflictReport::default())
}

/// Incremental mode. Instance failures are reported per node.
pub fn reduce_incremental(
    topology: &Topology,
    results: PhaseResults<CheckResponse>,
    errors: PhaseErrors,
) -> Result<ConflictReport> {
    let mut exceptions = node_errors(topology, errors);
    let mut per_node = BTreeMap::new();
    let mut responded = false;

    for (id, response) in results {
        let Some(response) = response else {
            continue;
        };
        responded = true;
        let node = topology.lookup(id);

        let instances = match response {
            CheckResponse::Incremental(instances) => instances,
            other => return Err(unexpected(&node, &other, "incremental")),
        };
        if let Some((_, err)) = instances.exceptions.into_iter().next() {
            exceptions.entry(node.clone()).or_insert(err);
        }
        per_node.insert(node, instances.results.into_values().collect::<Vec<_>>());
    }

    if !responded {
        return Err(Error::verify(exceptions));
    }

    Ok(reduce_incremental_results(per_node, exceptions))
}
