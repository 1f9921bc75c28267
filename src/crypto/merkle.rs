//! Merkle root computation for block bodies
//!
//! The root commits to the coinbase and every transaction id of a block,
//! so rolling the coinbase extra nonce yields a fresh header search space.

use super::hash::double_sha256;

/// Calculate the merkle root from a list of leaf hashes
///
/// Pairs are hashed with double SHA-256; an odd trailing node is paired
/// with itself.
pub fn calculate_merkle_root(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.is_empty() {
        return [0u8; 32];
    }

    let mut current_level: Vec<[u8; 32]> = hashes.to_vec();

    while current_level.len() > 1 {
        let next_level = current_level
            .chunks(2)
            .map(|chunk| {
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(&chunk[0]);
                data[32..].copy_from_slice(right);
                double_sha256(&data)
            })
            .collect();

        current_level = next_level;
    }

    current_level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![sha256(b"tx1")];
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = sha256(b"tx1");
        let hash2 = sha256(b"tx2");

        let mut expected = hash1.to_vec();
        expected.extend_from_slice(&hash2);

        assert_eq!(
            calculate_merkle_root(&[hash1, hash2]),
            double_sha256(&expected)
        );
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let a = sha256(b"tx1");
        let b = sha256(b"tx2");
        let c = sha256(b"tx3");

        assert_eq!(
            calculate_merkle_root(&[a, b, c]),
            calculate_merkle_root(&[a, b, c, c])
        );
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(calculate_merkle_root(&[]), [0u8; 32]);
    }
}
