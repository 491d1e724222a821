//! # snapverify
//!
//! Cluster-wide verification of partitioned storage snapshots:
//! - Two-phase check: snapshot metadata first, then partition data
//! - Replica comparison by update counter and content hash
//! - Pluggable snapshot handlers and incremental snapshot replay
//! - One check per snapshot at a time, aborted when a required node leaves
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! caller ── verify_snapshot ──► SnapshotCheckProcess (originating node)
//!                                 │
//!            ┌────────────────────┴────────────────────┐
//!            │ phase 1: check metas (every node)       │
//!            │   read local metadata ─► reduce:        │
//!            │   consistency, completeness, assignment │
//!            ├─────────────────────────────────────────┤
//!            │ phase 2: check parts (every node)       │
//!            │   hashes | handlers | incremental ─►    │
//!            │   reduce: ConflictReport                │
//!            └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Three nodes, two copies of every partition
//! snapverify --work-dir ./data generate snp --nodes a,b,c --backups 1
//!
//! # Compare replicas, validating every page
//! snapverify --work-dir ./data check snp --full
//!
//! # Replay incremental snapshot 2
//! snapverify --work-dir ./data check snp --incremental 2 --json
//! ```

pub mod cluster;
pub mod common;
pub mod ops;
pub mod snapshot;
pub mod verify;

// Re-export commonly used types
pub use cluster::{ClusterNode, NodeId, Topology};
pub use common::{Config, Error, Result};
pub use snapshot::{ConflictReport, SnapshotMetadata};
pub use verify::{CheckOptions, SnapshotCheckProcess};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
