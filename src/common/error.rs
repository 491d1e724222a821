//! Error types for snapverify

use crate::cluster::{ClusterNode, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Snapshot Data Errors ===
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error(
        "Failed to read page (CRC validation failed) [grpId={group_id}, partId={partition}, \
         page={page}, expected={expected:#010x}, actual={actual:#010x}]"
    )]
    PageCorrupted {
        group_id: i32,
        partition: u32,
        page: u32,
        expected: u32,
        actual: u32,
    },

    #[error("No snapshot metadatas found for the baseline nodes with consistent ids: {}", join(.0))]
    MissingMetadata(BTreeSet<String>),

    #[error("Snapshot metadata mismatch: {0}")]
    MetadataMismatch(String),

    #[error("Cache group(s) was not found in the snapshot [groups={}, snapshot={snapshot}]", join(.groups))]
    CacheGroupsNotFound {
        snapshot: String,
        groups: BTreeSet<String>,
    },

    #[error(
        "Snapshot data doesn't contain required cache groups [groups={}, snapshot={snapshot}, consId={consistent_id}]",
        join(.groups)
    )]
    MissingCacheGroups {
        snapshot: String,
        consistent_id: String,
        groups: BTreeSet<String>,
    },

    #[error(
        "Snapshot data doesn't contain required cache group partition [grpId={group_id}, snapshot={snapshot}, \
         consId={consistent_id}, missed={}]",
        join(.missed)
    )]
    MissingPartitions {
        snapshot: String,
        consistent_id: String,
        group_id: i32,
        missed: BTreeSet<u32>,
    },

    #[error("Incremental snapshot doesn't exist [snapshot={snapshot}, incIdx={index}, consId={consistent_id}]")]
    IncrementalNotFound {
        snapshot: String,
        index: i32,
        consistent_id: String,
    },

    // === Handler Errors ===
    #[error("Snapshot handler '{handler}' failed: {reason}")]
    Handler { handler: String, reason: String },

    #[error(
        "Snapshot handlers configuration mismatch (number of local snapshot handlers differs from the remote one). \
         Remote: [{}], local: [{}]",
        join(.remote),
        join(.local)
    )]
    HandlersMismatch {
        remote: BTreeSet<String>,
        local: BTreeSet<String>,
    },

    // === Operation Errors ===
    #[error("Validation of snapshot '{snapshot}' has already started. Request={request_id}.")]
    AlreadyStarted { snapshot: String, request_id: Uuid },

    #[error("The node is stopping: {0}")]
    NodeStopping(NodeId),

    #[error("Snapshot validation stopped. A required node left the cluster [nodeId={0}]")]
    RequiredNodeLeft(NodeId),

    #[error("{}", describe_failures(.errors))]
    Verify { errors: BTreeMap<ClusterNode, Error> },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Aggregates per-node failures.
    pub fn verify(errors: BTreeMap<ClusterNode, Error>) -> Self {
        Error::Verify { errors }
    }

    /// Does this error, or any error aggregated inside it, match `pred`?
    pub fn any_cause(&self, pred: impl Fn(&Error) -> bool + Copy) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Error::Verify { errors } => errors.values().any(|e| e.any_cause(pred)),
            _ => false,
        }
    }

    /// Was the operation aborted by a cluster membership change?
    pub fn is_topology_change(&self) -> bool {
        self.any_cause(|e| matches!(e, Error::RequiredNodeLeft(_) | Error::NodeStopping(_)))
    }
}

fn join<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_failures(errors: &BTreeMap<ClusterNode, Error>) -> String {
    if errors.is_empty() {
        return "Snapshot verification failed: no node produced a result".to_string();
    }
    let details = errors
        .iter()
        .map(|(node, err)| format!("[{}]: {}", node, err))
        .collect::<Vec<_>>()
        .join("; ");
    format!("Snapshot verification failed on {} node(s): {}", errors.len(), details)
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("verification task failed: {}", e))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
