//! Checks a node runs against its assigned snapshot instances
//!
//! Every instance is checked in its own task; the node answers once all
//! of them finished.

use crate::common::{Error, Result};
use crate::snapshot::{HandlerContext, HandlerRegistry, SnapshotMetadata, SnapshotStorage};
use crate::verify::request::VerificationRequest;
use crate::verify::response::{CheckResponse, InstanceResults};
use futures_util::future::join_all;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// How instances are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStrategy {
    /// Hash every partition and compare replicas
    PartitionHashes { full_check: bool },
    /// Run every registered snapshot handler
    CustomHandlers,
    /// Replay incremental segments up to the index
    Incremental { index: i32 },
}

impl CheckStrategy {
    pub fn for_request(request: &VerificationRequest) -> Self {
        if request.is_incremental() {
            CheckStrategy::Incremental {
                index: request.incremental_index(),
            }
        } else if request.all_handlers() {
            CheckStrategy::CustomHandlers
        } else {
            CheckStrategy::PartitionHashes {
                full_check: request.full_check(),
            }
        }
    }

    /// Check `metas`, all stored under `snapshot_dir`.
    pub async fn check(
        self,
        request: &VerificationRequest,
        metas: Vec<SnapshotMetadata>,
        snapshot_dir: PathBuf,
        storage: Arc<dyn SnapshotStorage>,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<CheckResponse> {
        let groups = request.groups().cloned();

        match self {
            CheckStrategy::PartitionHashes { full_check } => {
                let outcomes = for_each_instance(metas, |meta| {
                    let storage = storage.clone();
                    let dir = snapshot_dir.clone();
                    let groups = groups.clone();
                    async move {
                        storage
                            .check_partitions(&meta, &dir, groups.as_ref(), full_check)
                            .await
                    }
                })
                .await?;
                Ok(CheckResponse::PartitionHashes(collect(outcomes)))
            }

            CheckStrategy::Incremental { index } => {
                let outcomes = for_each_instance(metas, |meta| {
                    let storage = storage.clone();
                    let dir = snapshot_dir.clone();
                    async move { storage.check_incremental(&meta, &dir, index).await }
                })
                .await?;
                Ok(CheckResponse::Incremental(collect(outcomes)))
            }

            CheckStrategy::CustomHandlers => {
                let outcomes = for_each_instance(metas, |meta| {
                    let handlers = handlers.clone();
                    let ctx = HandlerContext {
                        metadata: meta,
                        snapshot_dir: snapshot_dir.clone(),
                        groups: groups.clone(),
                        storage: storage.clone(),
                    };
                    async move { handlers.invoke_all(&ctx).await }
                })
                .await?;

                let mut results = InstanceResults::default();
                for (cons, outcome) in outcomes {
                    results.results.insert(cons, outcome?);
                }
                Ok(CheckResponse::CustomHandlers(results))
            }
        }
    }
}

/// Run `check` for every instance concurrently. Outcomes are keyed by consistent id.
async fn for_each_instance<T, F, Fut>(
    metas: Vec<SnapshotMetadata>,
    check: F,
) -> Result<Vec<(String, Result<T>)>>
where
    T: Send + 'static,
    F: Fn(SnapshotMetadata) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let tasks: Vec<_> = metas
        .into_iter()
        .map(|meta| {
            let cons = meta.consistent_id.clone();
            let work = check(meta);
            tokio::spawn(async move { (cons, work.await) })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(tasks.len());
    for joined in join_all(tasks).await {
        outcomes.push(joined?);
    }
    Ok(outcomes)
}

fn collect<T>(outcomes: Vec<(String, Result<T>)>) -> InstanceResults<T> {
    let mut results = InstanceResults::default();
    for (cons, outcome) in outcomes {
        match outcome {
            Ok(res) => {
                results.results.insert(cons, res);
            }
            Err(e) => {
                tracing::warn!("Snapshot instance check failed [consId={}, err={}]", cons, e);
                results.exceptions.insert(cons, e);
            }
        }
    }
    results
}

impl std::fmt::Display for CheckStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStrategy::PartitionHashes { full_check } => {
                write!(f, "partition-hashes(full={})", full_check)
            }
            CheckStrategy::CustomHandlers => write!(f, "custom-handlers"),
            CheckStrategy::Incremental { index } => write!(f, "incremental(idx={})", index),
        }
    }
}

/// Incremental checks do not run snapshot handlers.
pub fn validate(request: &VerificationRequest) -> Result<()> {
    if request.is_incremental() && request.all_handlers() {
        return Err(Error::InvalidArgument(
            "Incremental snapshots do not support custom handlers".into(),
        ));
    }
    Ok(())
}
