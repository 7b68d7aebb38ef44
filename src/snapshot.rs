//! Bridge snapshots
//!
//! Saves the guest-visible state: non-zero physical pages, the allocator
//! bitmap, page-table root, heap cursor, reset vector and the pending-write
//! buffer. Restoring needs a fresh bridge of the same memory size.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::system::ResetVector;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSnapshot {
    /// Version for compatibility checking
    pub version: u32,

    /// Physical memory size (must match on restore)
    pub ram_size: u64,
    pub virtual_memory: bool,

    pub reset: ResetVector,
    pub heap_cursor: u64,
    pub errno_address: Option<u64>,

    /// Page allocator bitmap words
    pub allocator: Vec<u64>,

    /// Physical frame number -> page contents; all-zero frames are omitted
    pub pages: BTreeMap<u64, Vec<u8>>,

    /// Pending-write buffer, address order
    pub pending: Vec<(u64, u8)>,
}

impl BridgeSnapshot {
    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized =
            bincode::serialize(self).map_err(|e| BridgeError::Snapshot(format!("serialization error: {}", e)))?;

        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| BridgeError::Snapshot(format!("compression error: {}", e)))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let decompressed = zstd::stream::decode_all(data)
            .map_err(|e| BridgeError::Snapshot(format!("decompression error: {}", e)))?;

        let snapshot: Self = bincode::deserialize(&decompressed)
            .map_err(|e| BridgeError::Snapshot(format!("deserialization error: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(BridgeError::Snapshot(format!(
                "snapshot version {} unsupported (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Bytes of page data carried
    pub fn page_bytes(&self) -> usize {
        self.pages.values().map(Vec::len).sum()
    }
}
