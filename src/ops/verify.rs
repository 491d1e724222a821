//! Snapshot checks over a cluster work directory

use crate::common::{decode_name, Config, Error, Result};
use crate::ops::cluster::LocalCluster;
use crate::snapshot::ConflictReport;
use crate::verify::{CheckOptions, SnapshotCheckProcess};
use std::path::Path;
use std::time::Duration;

/// Check snapshot `name` from `process`, giving up after `timeout`.
///
/// The check itself keeps running after a timeout; only the wait ends.
pub async fn verify_snapshot(
    process: &SnapshotCheckProcess,
    name: &str,
    options: CheckOptions,
    timeout: Option<Duration>,
) -> Result<ConflictReport> {
    let check = process.verify_snapshot(name, options);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, check).await.map_err(|_| {
            Error::Timeout(format!(
                "snapshot check of '{}' did not finish within {:?}",
                name, limit
            ))
        })?,
        None => check.await,
    }
}

/// Consistent ids of the nodes found in a cluster work directory, sorted
pub fn discover_nodes(work_dir: &Path) -> Result<Vec<String>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            nodes.push(decode_name(name)?);
        }
    }
    nodes.sort();
    Ok(nodes)
}

/// Start a baseline node for every node directory under `work_dir` and
/// check snapshot `name` from the first one.
pub async fn check_work_dir(
    work_dir: &Path,
    config: &Config,
    name: &str,
    options: CheckOptions,
) -> Result<ConflictReport> {
    let nodes = discover_nodes(work_dir)?;
    if nodes.is_empty() {
        return Err(Error::NotFound(format!(
            "no node directories in {}",
            work_dir.display()
        )));
    }

    let cluster = LocalCluster::new(work_dir, config.storage.clone());
    let processes: Vec<_> = nodes.iter().map(|n| cluster.start_node(n, true)).collect();

    tracing::info!(
        "Checking snapshot [name={}, nodes={}, workDir={}]",
        name,
        processes.len(),
        work_dir.display()
    );

    let outcome = match processes.first() {
        Some(first) => verify_snapshot(first, name, options, config.check.timeout()?).await,
        None => Err(Error::Internal("no node started".into())),
    };

    cluster.shutdown();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::generate::{generate_snapshot, GenerateOptions};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_generated_snapshot_is_clean() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let options = GenerateOptions {
            name: "snp".into(),
            keys: 100,
            partitions: 4,
            ..Default::default()
        };
        generate_snapshot(dir.path(), &config.storage, &options).unwrap();

        assert_eq!(discover_nodes(dir.path()).unwrap(), options.nodes);

        let report = check_work_dir(dir.path(), &config, "snp", CheckOptions::new().full_check(true))
            .await
            .unwrap();
        assert!(report.is_clean(), "{}", report);
        assert_eq!(report.cluster_metas.len(), 3);
        assert_eq!(report.partitions.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();

        let err = check_work_dir(dir.path(), &Config::default(), "absent", CheckOptions::new())
            .await
            .unwrap_err();
        assert!(err.any_cause(|e| matches!(e, Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_work_dir() {
        let dir = tempdir().unwrap();
        let err = check_work_dir(dir.path(), &Config::default(), "snp", CheckOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
