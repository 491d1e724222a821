//! Snapshot artifacts and the checks run against them

pub mod checker;
pub mod handler;
pub mod incremental;
pub mod metadata;
pub mod partition;
pub mod report;
pub mod storage;

pub use checker::{reduce_hashes_results, reduce_incremental_results, reduce_metas_results};
pub use handler::{HandlerContext, HandlerRegistry, HandlerResult, PartitionHashesHandler, SnapshotHandler};
pub use incremental::{IncrementalCheckResult, TxRecord, TxState};
pub use metadata::SnapshotMetadata;
pub use partition::{PartitionHashRecord, PartitionKey};
pub use report::{ConflictReport, TxHashConflict};
pub use storage::{FsSnapshotStorage, SnapshotStorage};
