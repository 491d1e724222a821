//! Common utilities and types shared across snapverify

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{CheckConfig, Config, StorageConfig};
pub use error::{Error, Result};
pub use hash::{group_id, partition_for_key, select_replicas, tx_digest, Blake3Hasher};
pub use utils::{crc32, decode_name, encode_name, format_bytes, parse_duration, validate_snapshot_name};
