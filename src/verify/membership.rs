//! Reaction to nodes leaving while checks are running

use crate::cluster::{ClusterEvent, NodeId};
use crate::common::Error;
use crate::verify::context::{ClusterOps, ContextRegistry};
use crate::verify::process::SnapshotCheckProcess;
use std::sync::Weak;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Fail every running check that needs `left`.
///
/// The local work of such a check stops, and the caller's future (when
/// this node started the check) resolves with the same error. Whichever of
/// this and the regular completion comes first wins.
pub fn handle_node_left(
    local_id: NodeId,
    left: NodeId,
    registry: &ContextRegistry,
    cluster_ops: &ClusterOps,
) {
    for ctx in registry.contexts() {
        let request = ctx.request();
        if !request.nodes().contains(&left) {
            continue;
        }

        let err = if left == local_id {
            Error::NodeStopping(local_id)
        } else {
            Error::RequiredNodeLeft(left)
        };

        if ctx.fail(err.clone()) {
            tracing::warn!(
                "Snapshot validation stopped, required node left [snapshot={}, reqId={}, nodeId={}]",
                request.snapshot_name(),
                request.request_id(),
                left
            );
        }
        cluster_ops.complete(request.request_id(), Err(err));
    }
}

/// Deliver departures to `process` until it is dropped.
pub fn spawn_listener(
    process: Weak<SnapshotCheckProcess>,
    mut events: broadcast::Receiver<ClusterEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.is_departure() => {
                    let Some(process) = process.upgrade() else {
                        return;
                    };
                    process.on_node_left(event.node().id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Membership listener lagged, {} events missed", missed);
                    if let Some(process) = process.upgrade() {
                        process.on_events_lost();
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
