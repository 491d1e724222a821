//! Cluster-wide snapshot verification
//!
//! - `process`: the two-phase check and its public entry point
//! - `context`: running checks per node and mutual exclusion
//! - `assignment`: which node checks which snapshot instance
//! - `strategy`: partition hashes, custom handlers, incremental segments
//! - `reducer`: second phase responses into a report
//! - `membership`: failing checks when required nodes leave

pub mod assignment;
pub mod context;
pub mod membership;
pub mod process;
pub mod reducer;
pub mod request;
pub mod response;
pub mod strategy;

pub use assignment::assign_metas_to_work;
pub use context::{CheckContext, ClusterOps, ContextRegistry};
pub use process::{MetasPhase, PartsPhase, SnapshotCheckProcess};
pub use request::{CheckOptions, VerificationRequest};
pub use response::{CheckResponse, InstanceResults};
pub use strategy::CheckStrategy;
