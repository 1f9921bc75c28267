//! Block index records
//!
//! The fixed-size binary form in which block index nodes are persisted.
//! Records are appended to a log; on start-up the latest record for each
//! hash is enough to rebuild the in-memory block tree.

use crate::core::block::{BlockHash, Hash256};
use crate::storage::StorageError;
use bytes::{Buf, BufMut};

/// Encoded record size: height, hash, parent, bits, version, timestamp, status
pub const INDEX_RECORD_SIZE: usize = 4 + 32 + 32 + 4 + 4 + 8 + 1;

/// Persisted form of one block index node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub height: i32,
    pub hash: BlockHash,
    /// Parent hash, zero for genesis
    pub parent: BlockHash,
    pub bits: u32,
    pub version: i32,
    pub timestamp: i64,
    /// Raw `BlockStatus` bits
    pub status: u8,
}

impl IndexRecord {
    /// Little-endian fixed-size encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INDEX_RECORD_SIZE);
        buf.put_i32_le(self.height);
        buf.put_slice(self.hash.as_bytes());
        buf.put_slice(self.parent.as_bytes());
        buf.put_u32_le(self.bits);
        buf.put_i32_le(self.version);
        buf.put_i64_le(self.timestamp);
        buf.put_u8(self.status);
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, StorageError> {
        if data.len() != INDEX_RECORD_SIZE {
            return Err(StorageError::CorruptIndex(format!(
                "record is {} bytes, expected {}",
                data.len(),
                INDEX_RECORD_SIZE
            )));
        }

        let height = data.get_i32_le();
        let hash = read_hash(&mut data);
        let parent = read_hash(&mut data);
        Ok(Self {
            height,
            hash,
            parent,
            bits: data.get_u32_le(),
            version: data.get_i32_le(),
            timestamp: data.get_i64_le(),
            status: data.get_u8(),
        })
    }

    /// Decode a log of concatenated records.
    ///
    /// A torn trailing record from an interrupted append is dropped.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>, StorageError> {
        let torn = data.len() % INDEX_RECORD_SIZE;
        if torn != 0 {
            log::warn!(
                "Index log ends with a partial record ({} of {} bytes), ignoring it",
                torn,
                INDEX_RECORD_SIZE
            );
        }
        data[..data.len() - torn]
            .chunks_exact(INDEX_RECORD_SIZE)
            .map(Self::decode)
            .collect()
    }
}

fn read_hash(data: &mut &[u8]) -> Hash256 {
    let mut bytes = [0u8; 32];
    data.copy_to_slice(&mut bytes);
    Hash256::new(bytes)
}
