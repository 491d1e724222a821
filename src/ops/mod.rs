//! Ops commands: synthetic snapshots, local clusters and check runs

pub mod cluster;
pub mod generate;
pub mod verify;

pub use cluster::LocalCluster;
pub use generate::{generate_snapshot, node_dir, GenerateOptions, GenerateReport};
pub use verify::{check_work_dir, discover_nodes, verify_snapshot};
