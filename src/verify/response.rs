//! Per-node responses of the partition validation phase

use crate::common::Error;
use crate::snapshot::{HandlerResult, IncrementalCheckResult, PartitionHashRecord, PartitionKey};
use std::collections::BTreeMap;

/// Outcomes of the instances one node checked, keyed by consistent id
#[derive(Debug, Clone)]
pub struct InstanceResults<T> {
    pub results: BTreeMap<String, T>,
    pub exceptions: BTreeMap<String, Error>,
}

impl<T> Default for InstanceResults<T> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            exceptions: BTreeMap::new(),
        }
    }
}

impl<T> InstanceResults<T> {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.exceptions.is_empty()
    }
}

/// Partition hashes of every instance
pub type PartitionHashes = BTreeMap<PartitionKey, PartitionHashRecord>;

/// Results of every handler, by handler id
pub type HandlerResults = BTreeMap<String, HandlerResult>;

/// A node's answer in the second phase, one variant per check mode
#[derive(Debug, Clone)]
pub enum CheckResponse {
    PartitionHashes(InstanceResults<PartitionHashes>),
    CustomHandlers(InstanceResults<HandlerResults>),
    Incremental(InstanceResults<IncrementalCheckResult>),
}

impl CheckResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            CheckResponse::PartitionHashes(_) => "partition-hashes",
            CheckResponse::CustomHandlers(_) => "custom-handlers",
            CheckResponse::Incremental(_) => "incremental",
        }
    }
}
