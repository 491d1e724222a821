//! Concurrency, mutual exclusion and membership changes during a check

mod common;

use common::*;
use futures_util::future::join;
use snapverify::ops::{generate_snapshot, LocalCluster};
use snapverify::{CheckOptions, Error};

#[tokio::test]
async fn test_second_check_of_same_snapshot_rejected() {
    let dir = generated(options(SNAPSHOT));
    let gated = GatedCluster::start(dir.path(), GatePoint::Partitions);
    let nodes = &gated.nodes;

    let first = nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new());
    assert!(wait_until(|| gated.entered() > 0).await);

    // Same node: refused before anything is sent.
    let err = nodes[0]
        .verify_snapshot(SNAPSHOT, CheckOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyStarted { ref snapshot, .. } if snapshot == SNAPSHOT));

    // Another node already holds a context for the running check.
    let err = finished(nodes[2].verify_snapshot(SNAPSHOT, CheckOptions::new()))
        .await
        .unwrap_err();
    assert!(err.any_cause(|e| matches!(e, Error::AlreadyStarted { .. })));

    gated.open();
    let report = finished(first).await.unwrap();
    assert!(report.is_clean(), "{}", report);
}

#[tokio::test]
async fn test_different_snapshots_run_concurrently() {
    let dir = generated(options("snp-1"));
    generate_snapshot(dir.path(), &config(), &options("snp-2")).unwrap();

    let gated = GatedCluster::start(dir.path(), GatePoint::Partitions);
    let first = gated.nodes[0].verify_snapshot("snp-1", CheckOptions::new());
    let second = gated.nodes[1].verify_snapshot("snp-2", CheckOptions::new().full_check(true));

    assert!(wait_until(|| gated.nodes.iter().all(|n| n.active_checks().len() == 2)).await);
    assert_eq!(gated.nodes[2].active_checks(), vec!["snp-1", "snp-2"]);

    gated.open();
    let (first, second) = join(finished(first), finished(second)).await;
    assert!(first.unwrap().is_clean());
    assert!(second.unwrap().is_clean());
}

#[tokio::test]
async fn test_required_node_failure_aborts_check() {
    let dir = generated(options(SNAPSHOT));
    let gated = GatedCluster::start(dir.path(), GatePoint::Partitions);
    let nodes = &gated.nodes;

    let check = nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new());
    assert!(wait_until(|| gated.entered() > 0).await);

    gated.cluster.fail_node(nodes[2].local_id());

    // Resolves without the remaining nodes finishing their work.
    let err = finished(check).await.unwrap_err();
    assert!(matches!(err, Error::RequiredNodeLeft(id) if id == nodes[2].local_id()));
    assert!(err.is_topology_change());

    gated.open();
    assert!(wait_until(|| !nodes[0].has_context(SNAPSHOT) && !nodes[1].has_context(SNAPSHOT)).await);
    assert_eq!(nodes[0].pending_operations(), 0);
}

#[tokio::test]
async fn test_coordinator_failure_during_partition_phase() {
    let dir = generated(options(SNAPSHOT));
    let gated = GatedCluster::start(dir.path(), GatePoint::Partitions);
    let nodes = &gated.nodes;
    assert_eq!(gated.cluster.coordinator().unwrap().local_id(), nodes[0].local_id());

    let check = nodes[1].verify_snapshot(SNAPSHOT, CheckOptions::new());
    assert!(wait_until(|| gated.entered() > 0).await);

    gated.cluster.fail_node(nodes[0].local_id());

    let err = finished(check).await.unwrap_err();
    assert!(matches!(err, Error::RequiredNodeLeft(id) if id == nodes[0].local_id()));

    gated.open();
    assert!(wait_until(|| !nodes[1].has_context(SNAPSHOT) && !nodes[2].has_context(SNAPSHOT)).await);
    assert_eq!(nodes[1].pending_operations(), 0);
}

#[tokio::test]
async fn test_stopped_client_coordinator_hands_over() {
    let dir = generated(options(SNAPSHOT));
    let (gated, client) = GatedCluster::start_behind(dir.path(), GatePoint::Metas, "client");
    let nodes = &gated.nodes;

    let check = nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new());
    assert!(wait_until(|| gated.entered() == 3).await);

    // The next oldest node starts the partition phase.
    assert!(gated.cluster.stop_node(client.local_id()));
    assert!(!gated.cluster.topology().is_alive(client.local_id()));
    gated.open();

    let report = finished(check).await.unwrap();
    assert!(report.is_clean(), "{}", report);
    assert_eq!(report.cluster_metas.len(), 3);
}

#[tokio::test]
async fn test_failure_during_metadata_phase() {
    let dir = generated(options(SNAPSHOT));
    let gated = GatedCluster::start(dir.path(), GatePoint::Metas);
    let nodes = &gated.nodes;

    let check = nodes[1].verify_snapshot(SNAPSHOT, CheckOptions::new());
    assert!(wait_until(|| gated.entered() == 3).await);

    gated.cluster.stop_node(nodes[0].local_id());
    gated.open();

    let err = finished(check).await.unwrap_err();
    assert!(err.is_topology_change(), "{}", err);
    assert!(wait_until(|| !nodes[1].has_context(SNAPSHOT) && !nodes[2].has_context(SNAPSHOT)).await);
}

#[tokio::test]
async fn test_non_baseline_node_leaving_is_ignored() {
    let dir = generated(options(SNAPSHOT));
    let gated = GatedCluster::start(dir.path(), GatePoint::Partitions);
    let client = gated.cluster.start_node("client", false);

    let check = gated.nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new());
    assert!(wait_until(|| gated.entered() > 0).await);
    assert!(!client.has_context(SNAPSHOT));

    gated.cluster.fail_node(client.local_id());
    gated.open();

    let report = finished(check).await.unwrap();
    assert!(report.is_clean(), "{}", report);
    assert_eq!(report.cluster_metas.len(), 3);
}

#[tokio::test]
async fn test_check_started_from_non_baseline_node() {
    let dir = generated(options(SNAPSHOT));
    let cluster = LocalCluster::new(dir.path(), config());
    start_all(&cluster);
    let client = cluster.start_node("client", false);

    let report = finished(client.verify_snapshot(SNAPSHOT, CheckOptions::new()))
        .await
        .unwrap();
    assert!(report.is_clean(), "{}", report);
    assert_eq!(report.cluster_metas.len(), 3);
}

#[tokio::test]
async fn test_contexts_removed_after_check() {
    let dir = generated(options(SNAPSHOT));
    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    // Not started on the coordinator, so the others may still be reducing.
    let report = finished(nodes[2].verify_snapshot(SNAPSHOT, CheckOptions::new()))
        .await
        .unwrap();
    assert!(report.is_clean());

    assert!(wait_until(|| nodes.iter().all(|n| n.active_checks().is_empty())).await);
    assert!(nodes.iter().all(|n| n.pending_operations() == 0));

    // The same snapshot can be checked again.
    let report = finished(nodes[2].verify_snapshot(SNAPSHOT, CheckOptions::new()))
        .await
        .unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_stopped_node_refuses_checks() {
    let dir = generated(options(SNAPSHOT));
    let gated = GatedCluster::start(dir.path(), GatePoint::Partitions);
    let nodes = &gated.nodes;

    let check = nodes[1].verify_snapshot(SNAPSHOT, CheckOptions::new());
    assert!(wait_until(|| gated.entered() > 0).await);

    gated.cluster.stop_node(nodes[1].local_id());
    let err = finished(check).await.unwrap_err();
    assert!(matches!(err, Error::NodeStopping(_)));

    assert!(nodes[1].is_stopping());
    let err = nodes[1]
        .verify_snapshot("another", CheckOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NodeStopping(_)));
    gated.open();
}
