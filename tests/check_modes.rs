//! Incremental, custom handler and reduced topology checks

mod common;

use async_trait::async_trait;
use common::*;
use serde_json::Value;
use snapverify::ops::{node_dir, LocalCluster};
use snapverify::snapshot::incremental::{read_segment, segment_path, write_segment};
use snapverify::snapshot::{
    HandlerContext, HandlerRegistry, HandlerResult, PartitionHashesHandler, SnapshotHandler,
    TxRecord, TxState,
};
use snapverify::{CheckOptions, Error, Result};
use std::sync::Arc;

fn with_increments(n: i32) -> snapverify::ops::GenerateOptions {
    let mut opts = options(SNAPSHOT);
    opts.increments = n;
    opts
}

#[tokio::test]
async fn test_incremental_clean() {
    let dir = generated(with_increments(2));
    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    let report = finished(nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new().incremental(2)))
        .await
        .unwrap();
    assert!(report.is_clean(), "{}", report);
    assert!(report.partitions.is_empty());
    assert_eq!(report.cluster_metas.len(), 3);
}

#[tokio::test]
async fn test_missing_increment_fails_check() {
    let dir = generated(with_increments(1));
    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    let err = finished(nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new().incremental(2)))
        .await
        .unwrap_err();
    assert!(err.any_cause(|e| matches!(e, Error::IncrementalNotFound { index: 2, .. })));
}

#[tokio::test]
async fn test_incremental_rejects_handlers() {
    let dir = generated(with_increments(1));
    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    let err = nodes[0]
        .verify_snapshot(SNAPSHOT, CheckOptions::new().incremental(1).all_handlers(true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(!nodes[0].has_context(SNAPSHOT));
}

#[tokio::test]
async fn test_transaction_conflicts() {
    let dir = generated(with_increments(2));
    let snp_dir = snapshot_dir(dir.path(), NODES[0], SNAPSHOT);

    // Lose a committed transaction on one side.
    let first = segment_path(&snp_dir, 1, NODES[0]);
    let mut records = read_segment(&first).unwrap();
    let lost = records.remove(0);
    write_segment(&first, &records).unwrap();

    // A transaction that never committed.
    let second = segment_path(&snp_dir, 2, NODES[0]);
    let mut records = read_segment(&second).unwrap();
    records.push(TxRecord {
        tx_id: 42,
        state: TxState::Prepared,
        participants: lost.participants.clone(),
    });
    write_segment(&second, &records).unwrap();

    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    let report = finished(nodes[1].verify_snapshot(SNAPSHOT, CheckOptions::new().incremental(2)))
        .await
        .unwrap();

    assert!(report.has_tx_conflicts());
    let (node, txs) = report.partially_committed_txs.iter().next().unwrap();
    assert_eq!(node.consistent_id, NODES[0]);
    assert!(txs.contains(&42));

    let peer = lost.participants.iter().find(|p| *p != NODES[0]).unwrap();
    assert_eq!(report.tx_hash_conflicts.len(), 1);
    let conflict = &report.tx_hash_conflicts[0];
    let pair = [conflict.local_consistent_id.as_str(), conflict.remote_consistent_id.as_str()];
    assert!(pair.contains(&NODES[0]) && pair.contains(&peer.as_str()));
    assert!(report.to_string().contains("transaction conflicts has been found"));
}

#[tokio::test]
async fn test_all_handlers() {
    let dir = generated(options(SNAPSHOT));
    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    let report = finished(nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new().all_handlers(true)))
        .await
        .unwrap();
    assert!(report.is_clean(), "{}", report);
    assert_eq!(report.cluster_metas.len(), 3);
}

#[tokio::test]
async fn test_all_handlers_report_conflicts_as_failure() {
    let dir = generated(options(SNAPSHOT));
    let (_, _, path) = held_partition(dir.path(), NODES[1], SNAPSHOT);
    rewrite_content(&path);

    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    let err = finished(nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new().all_handlers(true)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Handler { ref handler, ref reason }
            if handler == PartitionHashesHandler::ID && reason.contains("hashConflicts=1")
    ));
}

#[tokio::test]
async fn test_handler_failure_fails_check() {
    let dir = generated(options(SNAPSHOT));
    let (_, _, path) = held_partition(dir.path(), NODES[2], SNAPSHOT);
    corrupt_page(&path);

    let cluster = LocalCluster::new(dir.path(), config());
    let nodes = start_all(&cluster);

    // The built-in handler always validates pages.
    let err = finished(nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new().all_handlers(true)))
        .await
        .unwrap_err();
    assert!(err.any_cause(|e| matches!(e, Error::Handler { reason, .. } if reason.contains("CRC"))));
}

/// Counts partitions per instance and checks every instance answered.
struct PartitionCount {
    expected: usize,
}

#[async_trait]
impl SnapshotHandler for PartitionCount {
    fn id(&self) -> &str {
        "partition-count"
    }

    async fn invoke(&self, ctx: &HandlerContext) -> Result<Value> {
        Ok(Value::from(ctx.metadata.partition_count()))
    }

    fn complete(&self, snapshot_name: &str, results: &[HandlerResult]) -> Result<()> {
        if results.len() != self.expected {
            return Err(Error::Handler {
                handler: self.id().to_string(),
                reason: format!("{} instances of {} answered", results.len(), snapshot_name),
            });
        }
        let total: u64 = results.iter().filter_map(|r| r.data.as_u64()).sum();
        if total == 0 {
            return Err(Error::Handler {
                handler: self.id().to_string(),
                reason: "no partitions".into(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_custom_handler() {
    let dir = generated(options(SNAPSHOT));

    let mut handlers = HandlerRegistry::empty();
    handlers.register(Arc::new(PartitionCount { expected: 3 }));
    let cluster = LocalCluster::new(dir.path(), config()).with_handlers(handlers);
    let nodes = start_all(&cluster);

    let report = finished(nodes[2].verify_snapshot(SNAPSHOT, CheckOptions::new().all_handlers(true)))
        .await
        .unwrap();
    assert!(report.is_clean());

    let mut handlers = HandlerRegistry::empty();
    handlers.register(Arc::new(PartitionCount { expected: 4 }));
    let cluster = LocalCluster::new(dir.path(), config()).with_handlers(handlers);
    let nodes = start_all(&cluster);

    let err = finished(nodes[0].verify_snapshot(SNAPSHOT, CheckOptions::new().all_handlers(true)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handler { ref reason, .. } if reason.contains("3 instances")));
}

#[tokio::test]
async fn test_smaller_topology_checks_orphaned_instances() {
    let dir = generated(options(SNAPSHOT));

    // The data of the third node now lives on the first one.
    copy_dir(
        &snapshot_dir(dir.path(), NODES[2], SNAPSHOT),
        &snapshot_dir(dir.path(), NODES[0], SNAPSHOT),
    );
    std::fs::remove_dir_all(node_dir(dir.path(), NODES[2])).unwrap();

    let cluster = LocalCluster::new(dir.path(), config());
    let a = cluster.start_node(NODES[0], true);
    cluster.start_node(NODES[1], true);

    let report = finished(a.verify_snapshot(SNAPSHOT, CheckOptions::new().full_check(true)))
        .await
        .unwrap();
    assert!(report.is_clean(), "{}", report);
    assert_eq!(report.cluster_metas.len(), 2);
    assert_eq!(report.cluster_metas.values().map(Vec::len).sum::<usize>(), 3);
    assert!(report.partitions.values().all(|r| r.len() == 2));
}
