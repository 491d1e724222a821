//! Partition files of a snapshot
//!
//! Header: [MAGIC:4][GROUP_ID:4][PARTITION:4][UPDATE_COUNTER:8][ENTRIES:8][PAGES:4][PRIMARY:1][CRC32:4]
//! Page:   [LEN:4][PAYLOAD:n][CRC32:4]
//! Payload is a run of entries: [KEY_LEN:4][KEY][VALUE_LEN:4][VALUE]
//!
//! An integrity-only scan validates the header. A full scan also validates
//! every page CRC and digests the payloads.

use crate::common::{crc32, encode_name, Blake3Hasher, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

const PART_MAGIC: [u8; 4] = [0x50, 0x52, 0x54, 0x31]; // "PRT1"

/// Encoded header length
pub const HEADER_LEN: usize = 37;

/// Offset of the update counter inside the header
pub const UPDATE_COUNTER_OFFSET: usize = 12;

/// A (cache group, partition) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub group_id: i32,
    pub group_name: String,
    pub partition_id: u32,
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "grpId={}, grpName={}, partId={}",
            self.group_id, self.group_name, self.partition_id
        )
    }
}

/// What one replica reports for a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHashRecord {
    pub key: PartitionKey,
    /// Instance the partition belongs to
    pub consistent_id: String,
    pub primary: bool,
    pub update_counter: u64,
    pub size: u64,
    /// Content digest, only computed by a full check
    pub hash: Option<String>,
}

impl std::fmt::Display for PartitionHashRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "consId={}, primary={}, updateCntr={}, size={}, hash={}",
            self.consistent_id,
            self.primary,
            self.update_counter,
            self.size,
            self.hash.as_deref().unwrap_or("-")
        )
    }
}

/// Directory name of a cache group inside an instance folder
pub fn cache_dir_name(group: &str) -> String {
    format!("cache-{}", encode_name(group))
}

pub fn partition_file_name(partition: u32) -> String {
    format!("part-{}.bin", partition)
}

/// Partition file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    pub group_id: i32,
    pub partition: u32,
    pub update_counter: u64,
    pub entries: u64,
    pub pages: u32,
    pub primary: bool,
}

impl PartitionHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&PART_MAGIC);
        buf[4..8].copy_from_slice(&self.group_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.partition.to_le_bytes());
        buf[12..20].copy_from_slice(&self.update_counter.to_le_bytes());
        buf[20..28].copy_from_slice(&self.entries.to_le_bytes());
        buf[28..32].copy_from_slice(&self.pages.to_le_bytes());
        buf[32] = u8::from(self.primary);
        let checksum = crc32(&buf[4..33]);
        buf[33..37].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        if buf[0..4] != PART_MAGIC {
            return Err(Error::Corrupted("invalid partition file magic".into()));
        }

        let stored = u32::from_le_bytes([buf[33], buf[34], buf[35], buf[36]]);
        if stored != crc32(&buf[4..33]) {
            return Err(Error::Corrupted(
                "partition header checksum mismatch".into(),
            ));
        }

        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u64_at = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(bytes)
        };

        Ok(Self {
            group_id: u32_at(4) as i32,
            partition: u32_at(8),
            update_counter: u64_at(12),
            entries: u64_at(20),
            pages: u32_at(28),
            primary: buf[32] != 0,
        })
    }
}

/// Write a partition file, packing entries into pages of at most `page_size` payload bytes.
pub fn write_partition(
    path: &Path,
    group_id: i32,
    partition: u32,
    update_counter: u64,
    primary: bool,
    entries: &[(Vec<u8>, Vec<u8>)],
    page_size: usize,
) -> Result<u64> {
    let mut pages: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();

    for (key, value) in entries {
        let encoded_len = 8 + key.len() + value.len();
        if !current.is_empty() && current.len() + encoded_len > page_size {
            pages.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&(key.len() as u32).to_le_bytes());
        current.extend_from_slice(key);
        current.extend_from_slice(&(value.len() as u32).to_le_bytes());
        current.extend_from_slice(value);
    }
    if !current.is_empty() {
        pages.push(current);
    }

    let header = PartitionHeader {
        group_id,
        partition,
        update_counter,
        entries: entries.len() as u64,
        pages: pages.len() as u32,
        primary,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&header.encode())?;

    let mut written = HEADER_LEN as u64;
    for page in &pages {
        writer.write_all(&(page.len() as u32).to_le_bytes())?;
        writer.write_all(page)?;
        writer.write_all(&crc32(page).to_le_bytes())?;
        written += 8 + page.len() as u64;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(written)
}

/// Result of reading one partition file
#[derive(Debug, Clone)]
pub struct PartitionScan {
    pub header: PartitionHeader,
    pub hash: Option<String>,
}

/// Read a partition file. With `full_check` every page is validated and digested.
pub fn scan_partition(path: &Path, full_check: bool) -> Result<PartitionScan> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).map_err(|e| truncated(path, e))?;
    let header = PartitionHeader::decode(&buf)
        .map_err(|e| Error::Corrupted(format!("{} [file={}]", e, path.display())))?;

    if !full_check {
        return Ok(PartitionScan { header, hash: None });
    }

    let mut hasher = Blake3Hasher::new();
    let mut page = Vec::new();
    let mut consumed = HEADER_LEN as u64;
    for page_idx in 0..header.pages {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).map_err(|e| truncated(path, e))?;
        let len = u32::from_le_bytes(len_buf) as u64;
        consumed += 4;

        // Payload plus its trailing CRC must fit in what is left of the file.
        if len + 4 > file_len.saturating_sub(consumed) {
            return Err(Error::Corrupted(format!(
                "page {} length {} exceeds partition file size [file={}]",
                page_idx,
                len,
                path.display()
            )));
        }
        consumed += len + 4;

        page.resize(len as usize, 0);
        reader.read_exact(&mut page).map_err(|e| truncated(path, e))?;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf).map_err(|e| truncated(path, e))?;
        let expected = u32::from_le_bytes(crc_buf);
        let actual = crc32(&page);
        if expected != actual {
            return Err(Error::PageCorrupted {
                group_id: header.group_id,
                partition: header.partition,
                page: page_idx,
                expected,
                actual,
            });
        }

        hasher.update(&page);
    }

    Ok(PartitionScan {
        header,
        hash: Some(hasher.finalize()),
    })
}

fn truncated(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::UnexpectedEof {
        Error::Corrupted(format!("truncated partition file: {}", path.display()))
    } else {
        e.into()
    }
}
