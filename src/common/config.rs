//! Configuration for snapverify components

use crate::common::{parse_duration, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix, e.g. `SNAPVERIFY__STORAGE__PARALLELISM=8`
const ENV_PREFIX: &str = "SNAPVERIFY";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Snapshot storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Defaults for check runs started from the CLI
    #[serde(default)]
    pub check: CheckConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory (relative to a node's work dir) holding its snapshots
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,

    /// Maximum partition files read concurrently on one node
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Page size used when writing partition files
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_snapshot_dir() -> String {
    "snapshots".to_string()
}
fn default_parallelism() -> usize {
    4
}
fn default_page_size() -> usize {
    4096
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            parallelism: default_parallelism(),
            page_size: default_page_size(),
        }
    }
}

/// Check run defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Validate page CRCs and compute content hashes by default
    #[serde(default)]
    pub full_check: bool,

    /// Give up waiting for the report after this long ("30s", "5m").
    /// The protocol itself never times out.
    #[serde(default)]
    pub timeout: Option<String>,
}

impl CheckConfig {
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("snapverify").required(false));
        }

        let config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.parallelism == 0 {
            return Err(crate::Error::InvalidConfig(
                "storage.parallelism must be positive".into(),
            ));
        }
        if self.storage.page_size < 64 {
            return Err(crate::Error::InvalidConfig(
                "storage.page_size must be at least 64 bytes".into(),
            ));
        }
        self.check.timeout()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.snapshot_dir, "snapshots");
        assert_eq!(config.storage.parallelism, 4);
        assert!(!config.check.full_check);
        assert!(config.check.timeout().unwrap().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapverify.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[storage]\nparallelism = 2\n[check]\nfull_check = true\ntimeout = \"30s\""
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.storage.parallelism, 2);
        assert_eq!(config.storage.page_size, 4096);
        assert!(config.check.full_check);
        assert_eq!(
            config.check.timeout().unwrap(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.storage.parallelism = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.check.timeout = Some("soon".into());
        assert!(config.validate().is_err());
    }
}
