//! Pluggable snapshot handlers
//!
//! A handler runs against every snapshot instance on the node holding it,
//! then cross-checks the results gathered from all nodes.

use crate::cluster::ClusterNode;
use crate::common::{Error, Result};
use crate::snapshot::checker::partition_conflicts;
use crate::snapshot::metadata::SnapshotMetadata;
use crate::snapshot::partition::{PartitionHashRecord, PartitionKey};
use crate::snapshot::storage::SnapshotStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// What one handler produced for one snapshot instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub consistent_id: String,
    pub data: Value,
}

/// Everything a handler may look at for one instance
#[derive(Clone)]
pub struct HandlerContext {
    pub metadata: SnapshotMetadata,
    pub snapshot_dir: PathBuf,
    pub groups: Option<BTreeSet<String>>,
    pub storage: Arc<dyn SnapshotStorage>,
}

#[async_trait]
pub trait SnapshotHandler: Send + Sync {
    /// Stable identifier, equal on every node
    fn id(&self) -> &str;

    /// Run against one local snapshot instance.
    async fn invoke(&self, ctx: &HandlerContext) -> Result<Value>;

    /// Cross-check the results of every instance in the cluster.
    fn complete(&self, _snapshot_name: &str, _results: &[HandlerResult]) -> Result<()> {
        Ok(())
    }
}

/// Built-in handler comparing full partition hashes between replicas
pub struct PartitionHashesHandler;

impl PartitionHashesHandler {
    pub const ID: &'static str = "partition-hashes";
}

#[async_trait]
impl SnapshotHandler for PartitionHashesHandler {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn invoke(&self, ctx: &HandlerContext) -> Result<Value> {
        let records = ctx
            .storage
            .check_partitions(&ctx.metadata, &ctx.snapshot_dir, ctx.groups.as_ref(), true)
            .await?;
        let records: Vec<PartitionHashRecord> = records.into_values().collect();
        Ok(serde_json::to_value(records)?)
    }

    fn complete(&self, _snapshot_name: &str, results: &[HandlerResult]) -> Result<()> {
        let mut partitions: BTreeMap<PartitionKey, Vec<PartitionHashRecord>> = BTreeMap::new();
        for result in results {
            let records: Vec<PartitionHashRecord> = serde_json::from_value(result.data.clone())?;
            for record in records {
                partitions.entry(record.key.clone()).or_default().push(record);
            }
        }

        let (mut counters, mut hashes) = (0, 0);
        for records in partitions.values() {
            let (counter_conflict, hash_conflict) = partition_conflicts(records);
            counters += usize::from(counter_conflict);
            hashes += usize::from(hash_conflict);
        }

        if counters + hashes > 0 {
            return Err(Error::Handler {
                handler: Self::ID.to_string(),
                reason: format!(
                    "conflict partitions has been found: [counterConflicts={}, hashConflicts={}]",
                    counters, hashes
                ),
            });
        }
        Ok(())
    }
}

/// Handlers known to a node
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn SnapshotHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PartitionHashesHandler));
        registry
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler, replacing one with the same id.
    pub fn register(&mut self, handler: Arc<dyn SnapshotHandler>) {
        self.handlers.retain(|h| h.id() != handler.id());
        self.handlers.push(handler);
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.handlers.iter().map(|h| h.id().to_string()).collect()
    }

    /// Run every handler against one instance; the first failure fails the instance.
    pub async fn invoke_all(&self, ctx: &HandlerContext) -> Result<BTreeMap<String, HandlerResult>> {
        let mut results = BTreeMap::new();
        for handler in &self.handlers {
            let data = handler.invoke(ctx).await.map_err(|e| Error::Handler {
                handler: handler.id().to_string(),
                reason: format!("consId={}: {}", ctx.metadata.consistent_id, e),
            })?;
            results.insert(
                handler.id().to_string(),
                HandlerResult {
                    consistent_id: ctx.metadata.consistent_id.clone(),
                    data,
                },
            );
        }
        Ok(results)
    }

    /// Cross-check handler results reported by every node: node -> consistent id -> handler id -> result.
    pub fn check_results(
        &self,
        snapshot_name: &str,
        results: &BTreeMap<ClusterNode, BTreeMap<String, BTreeMap<String, HandlerResult>>>,
    ) -> Result<()> {
        let local = self.ids();
        let mut by_handler: BTreeMap<&str, Vec<HandlerResult>> = BTreeMap::new();

        for per_instance in results.values() {
            for handler_results in per_instance.values() {
                let remote: BTreeSet<String> = handler_results.keys().cloned().collect();
                if remote != local {
                    return Err(Error::HandlersMismatch { remote, local });
                }
                for (id, result) in handler_results {
                    by_handler.entry(id.as_str()).or_default().push(result.clone());
                }
            }
        }

        for handler in &self.handlers {
            let results = by_handler.remove(handler.id()).unwrap_or_default();
            handler.complete(snapshot_name, &results)?;
        }
        Ok(())
    }
}
