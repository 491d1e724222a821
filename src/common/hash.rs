//! Hashing utilities for snapverify
//!
//! - BLAKE3 for partition content digests
//! - Stable cache group ids derived from group names
//! - HRW (Highest Random Weight) for replica placement of generated snapshots

use blake3::Hasher;

/// Compute BLAKE3 hash incrementally (for streaming partition pages)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        hex::encode(hash.as_bytes())
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

fn prefix_u64(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// Stable cache group id for a group name
pub fn group_id(name: &str) -> i32 {
    prefix_u64(name.as_bytes()) as i32
}

/// Partition a key falls into
pub fn partition_for_key(key: &[u8], partitions: u32) -> u32 {
    (prefix_u64(key) % u64::from(partitions.max(1))) as u32
}

/// 64-bit digest of a transaction id, combined with XOR so order never matters
pub fn tx_digest(tx_id: u64) -> u64 {
    prefix_u64(&tx_id.to_le_bytes())
}

/// HRW (Highest Random Weight) hashing for replica placement
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key).
fn hrw_hash(key: &str, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = nodes
        .iter()
        .map(|node| {
            let combined = format!("{}{}", key, node);
            (node.clone(), prefix_u64(combined.as_bytes()))
        })
        .collect();

    // Sort by weight (descending)
    weights.sort_by(|a, b| b.1.cmp(&a.1));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Select N replicas using HRW hashing
pub fn select_replicas(key: &str, nodes: &[String], n: usize) -> Vec<String> {
    let sorted = hrw_hash(key, nodes);
    sorted.into_iter().take(n).collect()
}
