//! Cluster plumbing the verification protocol runs on
//!
//! - Topology view with join order, baseline flag and membership events
//! - Two-step distributed phases (local action, then reduce)
//! - Single-assignment completions shared between tasks

pub mod future;
pub mod phase;
pub mod topology;

pub use future::Completion;
pub use phase::{
    DistributedProcess, InProcessPhase, LocalAction, PhaseErrors, PhaseKind, PhaseResults,
    ReduceAction,
};
pub use topology::{ClusterEvent, ClusterNode, NodeId, Topology};
