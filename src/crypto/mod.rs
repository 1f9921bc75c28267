//! Cryptographic utilities for the blockchain
//!
//! This module provides:
//! - SHA-256 identity hashing
//! - Per-algorithm proof-of-work hashing
//! - Merkle root calculation

pub mod hash;
pub mod merkle;

pub use hash::{double_sha256, double_sha256_hex, pow_hash, sha256};
pub use merkle::calculate_merkle_root;
