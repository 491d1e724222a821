//! Snapshot metadata files
//!
//! One metadata file per snapshot instance, named after the consistent id
//! of the node that produced it.
//! File format: [MAGIC:4][LEN:4][BINCODE PAYLOAD][CRC32:4]

use crate::common::{crc32, decode_name, encode_name, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const META_MAGIC: [u8; 4] = [0x53, 0x4D, 0x46, 0x31]; // "SMF1"

/// Metadata file extension
pub const METAFILE_EXT: &str = "smf";

/// Describes one node's on-disk snapshot instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Id of the operation that created the snapshot
    pub request_id: Uuid,
    pub snapshot_name: String,
    /// Identity of the node that produced this instance
    pub consistent_id: String,
    /// Data folder of this instance under `db/`
    pub folder_name: String,
    pub page_size: u32,
    /// Every cache group in the snapshot: id -> name
    pub cache_groups: BTreeMap<i32, String>,
    /// Partitions this instance holds, per group id
    pub partitions: BTreeMap<i32, BTreeSet<u32>>,
    /// Consistent ids of the baseline at snapshot time
    pub baseline_nodes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotMetadata {
    /// Do both instances belong to the same snapshot?
    pub fn same_snapshot(&self, other: &SnapshotMetadata) -> bool {
        self.request_id == other.request_id
            && self.snapshot_name == other.snapshot_name
            && self.page_size == other.page_size
            && self.cache_groups == other.cache_groups
            && self.baseline_nodes == other.baseline_nodes
    }

    pub fn file_name(consistent_id: &str) -> String {
        format!("{}.{}", encode_name(consistent_id), METAFILE_EXT)
    }

    /// Group ids of the given names present in this snapshot; unknown names are returned separately.
    pub fn resolve_groups(&self, names: &BTreeSet<String>) -> (BTreeSet<i32>, BTreeSet<String>) {
        let mut found = BTreeSet::new();
        let mut missing = BTreeSet::new();
        for name in names {
            match self.cache_groups.iter().find(|(_, n)| *n == name) {
                Some((id, _)) => {
                    found.insert(*id);
                }
                None => {
                    missing.insert(name.clone());
                }
            }
        }
        (found, missing)
    }

    /// Number of partitions held by this instance
    pub fn partition_count(&self) -> usize {
        self.partitions.values().map(BTreeSet::len).sum()
    }

    /// Write to `<dir>/<consistent id>.smf`
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;

        let payload = bincode::serialize(self)?;
        let path = dir.join(Self::file_name(&self.consistent_id));
        let mut file = fs::File::create(&path)?;

        file.write_all(&META_MAGIC)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc32(&payload).to_le_bytes())?;
        file.sync_all()?;

        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        if bytes.len() < 12 || bytes[0..4] != META_MAGIC {
            return Err(Error::Corrupted(format!(
                "invalid snapshot metadata file: {}",
                path.display()
            )));
        }

        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if bytes.len() != 8 + len + 4 {
            return Err(Error::Corrupted(format!(
                "truncated snapshot metadata file: {}",
                path.display()
            )));
        }

        let payload = &bytes[8..8 + len];
        let stored = u32::from_le_bytes([
            bytes[8 + len],
            bytes[9 + len],
            bytes[10 + len],
            bytes[11 + len],
        ]);
        if stored != crc32(payload) {
            return Err(Error::Corrupted(format!(
                "snapshot metadata checksum mismatch: {}",
                path.display()
            )));
        }

        Ok(bincode::deserialize(payload)?)
    }

    /// Read every metadata file in a snapshot directory, sorted by consistent id.
    /// A missing directory yields no metadata.
    pub fn read_all(dir: &Path) -> Result<Vec<Self>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METAFILE_EXT) {
                continue;
            }

            let meta = Self::read(&path)?;
            let expected = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(decode_name)
                .transpose()?;
            if expected.as_deref() != Some(meta.consistent_id.as_str()) {
                return Err(Error::Corrupted(format!(
                    "metadata file {} describes consistent id {}",
                    path.display(),
                    meta.consistent_id
                )));
            }
            metas.push(meta);
        }

        metas.sort_by(|a, b| a.consistent_id.cmp(&b.consistent_id));
        Ok(metas)
    }
}
