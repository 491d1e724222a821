//! Snapshot check requests

use crate::cluster::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Caller options for a snapshot check
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Directory holding the snapshot instead of the configured one
    pub path: Option<PathBuf>,
    /// Only check these cache groups
    pub groups: Option<BTreeSet<String>>,
    /// Validate page CRCs and compare content hashes
    pub full_check: bool,
    /// Incremental snapshot index to check; 0 checks the full snapshot
    pub incremental_index: i32,
    /// Run every registered snapshot handler instead of hashing partitions
    pub all_handlers: bool,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups: BTreeSet<String> = groups.into_iter().map(Into::into).collect();
        self.groups = (!groups.is_empty()).then_some(groups);
        self
    }

    pub fn full_check(mut self, full: bool) -> Self {
        self.full_check = full;
        self
    }

    pub fn incremental(mut self, index: i32) -> Self {
        self.incremental_index = index;
        self
    }

    pub fn all_handlers(mut self, all: bool) -> Self {
        self.all_handlers = all;
        self
    }
}

/// One snapshot check, identical on every node for both phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    request_id: Uuid,
    nodes: BTreeSet<NodeId>,
    snapshot_name: String,
    snapshot_path: Option<PathBuf>,
    groups: Option<BTreeSet<String>>,
    full_check: bool,
    incremental_index: i32,
    all_handlers: bool,
}

impl VerificationRequest {
    pub fn new(
        request_id: Uuid,
        nodes: BTreeSet<NodeId>,
        snapshot_name: impl Into<String>,
        options: CheckOptions,
    ) -> Self {
        Self {
            request_id,
            nodes,
            snapshot_name: snapshot_name.into(),
            snapshot_path: options.path,
            groups: options.groups.filter(|g| !g.is_empty()),
            full_check: options.full_check,
            incremental_index: options.incremental_index.max(0),
            all_handlers: options.all_handlers,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Nodes that must stay in the cluster until the check completes
    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn groups(&self) -> Option<&BTreeSet<String>> {
        self.groups.as_ref()
    }

    pub fn full_check(&self) -> bool {
        self.full_check
    }

    pub fn incremental_index(&self) -> i32 {
        self.incremental_index
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental_index > 0
    }

    pub fn all_handlers(&self) -> bool {
        self.all_handlers
    }
}

impl fmt::Display for VerificationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reqId={}, snapshot={}, nodes={}, full={}, incIdx={}, allHandlers={}",
            self.request_id,
            self.snapshot_name,
            self.nodes.len(),
            self.full_check,
            self.incremental_index,
            self.all_handlers
        )?;
        if let Some(groups) = &self.groups {
            write!(f, ", groups={:?}", groups)?;
        }
        Ok(())
    }
}
