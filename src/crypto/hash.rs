//! Cryptographic hashing utilities for the blockchain
//!
//! Provides the SHA-256 based identity hashes used for block and transaction
//! ids, and the per-algorithm proof-of-work hashes selected by the block
//! header version.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2s256};
use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for block identity hashes in Bitcoin-style blockchains
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// Computes the proof-of-work hash of `data` with the named algorithm.
///
/// `sha256d`, `blake2b` and `blake2s` are hashed natively. The remaining
/// algorithms of the era tables hash through a double SHA-256 over the
/// algorithm name followed by the data, which keeps their outputs disjoint.
pub fn pow_hash(algo: &str, data: &[u8]) -> [u8; 32] {
    match algo {
        "sha256d" => double_sha256(data),
        "blake2b" => {
            let mut hasher = Blake2b::<U32>::new();
            hasher.update(data);
            hasher.finalize().into()
        }
        "blake2s" => {
            let mut hasher = Blake2s256::new();
            hasher.update(data);
            hasher.finalize().into()
        }
        other => {
            let mut tagged = Vec::with_capacity(other.len() + 1 + data.len());
            tagged.extend_from_slice(other.as_bytes());
            tagged.push(0);
            tagged.extend_from_slice(data);
            double_sha256(&tagged)
        }
    }
}
