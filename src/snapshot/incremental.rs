//! Incremental snapshot segments
//!
//! Each incremental index holds one segment per node, a sequence of
//! transaction records:
//! [MAGIC:4][TX_ID:8][STATE:1][COUNT:2]([LEN:2][CONSISTENT_ID])*[CRC32:4]
//!
//! Checking index `n` replays segments `1..=n` of one node.

use crate::common::{crc32, encode_name, tx_digest, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const INC_MAGIC: [u8; 4] = [0x49, 0x4E, 0x43, 0x31]; // "INC1"

/// Directory holding incremental segments inside a snapshot directory
pub const INCREMENTS_DIR: &str = "increments";

/// Segment file extension
pub const SEGMENT_EXT: &str = "inc";

/// Transaction state recorded in a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Prepared,
    Committed,
}

impl TxState {
    fn to_byte(self) -> u8 {
        match self {
            TxState::Committed => 1,
            TxState::Prepared => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(TxState::Committed),
            2 => Ok(TxState::Prepared),
            other => Err(Error::Corrupted(format!("unknown tx state: {}", other))),
        }
    }
}

/// One transaction record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub tx_id: u64,
    pub state: TxState,
    /// Consistent ids of every node taking part in the transaction
    pub participants: BTreeSet<String>,
}

impl TxRecord {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        buf.extend_from_slice(&INC_MAGIC);
        buf.extend_from_slice(&self.tx_id.to_le_bytes());
        buf.push(self.state.to_byte());

        let count = u16::try_from(self.participants.len())
            .map_err(|_| Error::InvalidArgument("too many tx participants".into()))?;
        buf.extend_from_slice(&count.to_le_bytes());
        for p in &self.participants {
            let len = u16::try_from(p.len())
                .map_err(|_| Error::InvalidArgument(format!("consistent id too long: {}", p)))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(p.as_bytes());
        }

        let checksum = crc32(&buf[start + 4..]);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(())
    }
}

/// Directory of incremental index `index`
pub fn increment_dir(snapshot_dir: &Path, index: i32) -> PathBuf {
    snapshot_dir
        .join(INCREMENTS_DIR)
        .join(format!("{:016}", index))
}

/// Segment file of `consistent_id` for incremental index `index`
pub fn segment_path(snapshot_dir: &Path, index: i32, consistent_id: &str) -> PathBuf {
    increment_dir(snapshot_dir, index).join(format!("{}.{}", encode_name(consistent_id), SEGMENT_EXT))
}

/// Write a segment file
pub fn write_segment(path: &Path, records: &[TxRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut buf = Vec::new();
    for record in records {
        record.encode(&mut buf)?;
    }

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&buf)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read every record of a segment file
pub fn read_segment(path: &Path) -> Result<Vec<TxRecord>> {
    let bytes = fs::read(path)?;
    let corrupted = |what: &str, offset: usize| {
        Error::Corrupted(format!(
            "{} in incremental segment {} at offset {}",
            what,
            path.display(),
            offset
        ))
    };

    let mut records = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let start = pos;
        let truncated = || corrupted("truncated record", start);

        if take(&bytes, &mut pos, 4).ok_or_else(truncated)? != INC_MAGIC {
            return Err(corrupted("invalid record magic", start));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(take(&bytes, &mut pos, 8).ok_or_else(truncated)?);
        let state = TxState::from_byte(take(&bytes, &mut pos, 1).ok_or_else(truncated)?[0])?;

        let count = take_u16(&bytes, &mut pos).ok_or_else(truncated)?;
        let mut participants = BTreeSet::new();
        for _ in 0..count {
            let len = take_u16(&bytes, &mut pos).ok_or_else(truncated)? as usize;
            let name = std::str::from_utf8(take(&bytes, &mut pos, len).ok_or_else(truncated)?)
                .map_err(|_| corrupted("invalid participant id", start))?;
            participants.insert(name.to_string());
        }

        let body_end = pos;
        let stored = take(&bytes, &mut pos, 4).ok_or_else(truncated)?;
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        if stored != crc32(&bytes[start + 4..body_end]) {
            return Err(corrupted("record checksum mismatch", start));
        }

        records.push(TxRecord {
            tx_id: u64::from_le_bytes(id),
            state,
            participants,
        });
    }

    Ok(records)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
    let slice = bytes.get(*pos..*pos + n)?;
    *pos += n;
    Some(slice)
}

fn take_u16(bytes: &[u8], pos: &mut usize) -> Option<u16> {
    take(bytes, pos, 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Outcome of replaying one node's incremental segments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalCheckResult {
    pub consistent_id: String,
    /// Committed transactions seen
    pub total_txs: u64,
    /// Prepared transactions that never committed
    pub partially_committed: BTreeSet<u64>,
    /// Per remote participant: XOR of digests of committed transactions shared with it
    pub tx_hashes: BTreeMap<String, u64>,
}

/// Replay segments `1..=index` of `consistent_id`.
pub fn check_segments(
    snapshot_name: &str,
    snapshot_dir: &Path,
    consistent_id: &str,
    index: i32,
) -> Result<IncrementalCheckResult> {
    let mut prepared = BTreeSet::new();
    let mut committed = BTreeSet::new();
    let mut result = IncrementalCheckResult {
        consistent_id: consistent_id.to_string(),
        ..Default::default()
    };

    for idx in 1..=index {
        let path = segment_path(snapshot_dir, idx, consistent_id);
        if !path.exists() {
            return Err(Error::IncrementalNotFound {
                snapshot: snapshot_name.to_string(),
                index: idx,
                consistent_id: consistent_id.to_string(),
            });
        }

        for record in read_segment(&path)? {
            match record.state {
                TxState::Prepared => {
                    prepared.insert(record.tx_id);
                }
                TxState::Committed => {
                    if !committed.insert(record.tx_id) {
                        continue;
                    }
                    result.total_txs += 1;
                    for participant in record.participants.iter().filter(|p| *p != consistent_id) {
                        *result.tx_hashes.entry(participant.clone()).or_insert(0) ^=
                            tx_digest(record.tx_id);
                    }
                }
            }
        }
    }

    result.partially_committed = prepared.difference(&committed).copied().collect();
    Ok(result)
}
