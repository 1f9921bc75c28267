//! Block implementation for the blockchain
//!
//! A block is a fixed-size header plus a coinbase and the ids of the
//! transactions it commits to. The header version selects the
//! proof-of-work algorithm, so the same header can be hashed in two ways:
//! the identity hash (double SHA-256) and the proof-of-work hash.

use crate::crypto::{calculate_merkle_root, double_sha256, pow_hash};
use bytes::BufMut;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Block Constants
// =============================================================================

/// Serialized header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 84;

// =============================================================================
// Hash256
// =============================================================================

/// A 32-byte hash stored in little-endian byte order.
///
/// Displayed and parsed as big-endian hex, so leading zeros of a strong
/// proof of work appear on the left.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256([u8; 32]);

/// Identity hash of a block header
pub type BlockHash = Hash256;

/// Transaction id
pub type TxId = Hash256;

impl Hash256 {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Block Header
// =============================================================================

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Header version; selects the proof-of-work algorithm
    pub version: i32,
    /// Identity hash of the parent block
    pub prev_block: BlockHash,
    /// Merkle root over the coinbase and transaction ids
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Little-endian wire encoding
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE);
        buf.put_i32_le(self.version);
        buf.put_slice(self.prev_block.as_bytes());
        buf.put_slice(self.merkle_root.as_bytes());
        buf.put_i64_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
        buf
    }

    /// Identity hash
    pub fn block_hash(&self) -> BlockHash {
        Hash256(double_sha256(&self.serialize()))
    }

    /// Proof-of-work hash under the named algorithm
    pub fn pow_hash(&self, algo: &str) -> Hash256 {
        Hash256(pow_hash(algo, &self.serialize()))
    }
}

// =============================================================================
// Coinbase
// =============================================================================

/// The generating input of a block
///
/// Its extra nonce widens the header search space once the 32-bit nonce
/// is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coinbase {
    /// Payout address
    pub address: String,
    /// Height the coinbase claims; makes every coinbase unique
    pub height: i32,
    pub extra_nonce: u64,
}

impl Coinbase {
    pub fn new(address: &str, height: i32, extra_nonce: u64) -> Self {
        Self {
            address: address.to_string(),
            height,
            extra_nonce,
        }
    }

    pub fn id(&self) -> TxId {
        let mut buf = Vec::with_capacity(self.address.len() + 12);
        buf.put_slice(self.address.as_bytes());
        buf.put_i32_le(self.height);
        buf.put_u64_le(self.extra_nonce);
        Hash256(double_sha256(&buf))
    }
}

// =============================================================================
// Block
// =============================================================================

/// A block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub coinbase: Coinbase,
    /// Ids of the committed transactions, excluding the coinbase
    pub transactions: Vec<TxId>,
}

impl Block {
    pub fn new(header: BlockHeader, coinbase: Coinbase, transactions: Vec<TxId>) -> Self {
        Self {
            header,
            coinbase,
            transactions,
        }
    }

    /// Identity hash of the header
    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Merkle root over the coinbase id followed by the transactions
    pub fn calculate_merkle_root(&self) -> Hash256 {
        let leaves: Vec<[u8; 32]> = std::iter::once(self.coinbase.id())
            .chain(self.transactions.iter().copied())
            .map(|h| *h.as_bytes())
            .collect();
        Hash256(calculate_merkle_root(&leaves))
    }

    /// Recompute the header's merkle root after the body changed
    pub fn update_merkle_root(&mut self) {
        self.header.merkle_root = self.calculate_merkle_root();
    }

    pub fn verify_merkle_root(&self) -> bool {
        self.header.merkle_root == self.calculate_merkle_root()
    }
}
