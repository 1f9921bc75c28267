//! Orphan block pool
//!
//! Blocks whose parent is not yet known wait here, indexed by the parent
//! hash so they can be connected as soon as the parent is accepted.

use crate::core::block::{Block, BlockHash};
use std::collections::HashMap;

/// Maximum number of orphan blocks to keep in memory
pub const MAX_ORPHAN_BLOCKS: usize = 100;

/// Seconds an orphan may wait for its parent
pub const ORPHAN_BLOCK_EXPIRE_TIME: i64 = 3600;

/// An orphan block waiting for its parent
#[derive(Debug, Clone)]
pub struct OrphanBlock {
    pub block: Block,
    /// Unix time after which the orphan is dropped
    pub expires_at: i64,
}

impl OrphanBlock {
    pub fn new(block: Block, received_at: i64) -> Self {
        Self {
            block,
            expires_at: received_at + ORPHAN_BLOCK_EXPIRE_TIME,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.block.header.prev_block
    }
}

/// Orphans by hash and by parent hash
#[derive(Debug, Default)]
pub struct OrphanPool {
    orphans: HashMap<BlockHash, OrphanBlock>,
    by_parent: HashMap<BlockHash, Vec<BlockHash>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Add an orphan, evicting expired ones and then the oldest if full
    pub fn add_orphan(&mut self, block: Block, now: i64) -> bool {
        let hash = block.hash();
        if self.orphans.contains_key(&hash) {
            return false;
        }

        self.prune_orphans(now);
        if self.orphans.len() >= MAX_ORPHAN_BLOCKS {
            let oldest = self
                .orphans
                .iter()
                .min_by_key(|(h, o)| (o.expires_at, **h))
                .map(|(h, _)| *h);
            if let Some(oldest) = oldest {
                self.remove_orphan(&oldest);
            }
        }

        let orphan = OrphanBlock::new(block, now);
        self.by_parent
            .entry(orphan.parent_hash())
            .or_default()
            .push(hash);
        self.orphans.insert(hash, orphan);
        true
    }

    pub fn remove_orphan(&mut self, hash: &BlockHash) -> Option<OrphanBlock> {
        let orphan = self.orphans.remove(hash)?;
        let parent = orphan.parent_hash();
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(orphan)
    }

    /// Remove and return every orphan waiting on `parent`
    pub fn take_children(&mut self, parent: &BlockHash) -> Vec<Block> {
        let hashes = self.by_parent.remove(parent).unwrap_or_default();
        hashes
            .iter()
            .filter_map(|h| self.orphans.remove(h))
            .map(|o| o.block)
            .collect()
    }

    pub fn prune_orphans(&mut self, now: i64) {
        let expired: Vec<BlockHash> = self
            .orphans
            .iter()
            .filter(|(_, o)| o.is_expired(now))
            .map(|(h, _)| *h)
            .collect();

        for hash in expired {
            log::debug!("Expired orphan block {}", hash);
            self.remove_orphan(&hash);
        }
    }

    /// The missing ancestor at the root of an orphan chain
    pub fn orphan_root(&self, hash: &BlockHash) -> BlockHash {
        let mut root = *hash;
        while let Some(orphan) = self.orphans.get(&root) {
            root = orphan.parent_hash();
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{BlockHeader, Coinbase, Hash256};

    fn block(prev: Hash256, nonce: u32) -> Block {
        let header = BlockHeader {
            version: 2,
            prev_block: prev,
            merkle_root: Hash256::zero(),
            timestamp: 0,
            bits: 0x207fffff,
            nonce,
        };
        Block::new(header, Coinbase::new("a", 0, 0), vec![])
    }

    #[test]
    fn test_children_by_parent() {
        let mut pool = OrphanPool::new();
        let parent = Hash256::new([1; 32]);
        let a = block(parent, 1);
        let b = block(parent, 2);
        let c = block(a.hash(), 3);

        assert!(pool.add_orphan(a.clone(), 0));
        assert!(!pool.add_orphan(a.clone(), 0));
        pool.add_orphan(b.clone(), 0);
        pool.add_orphan(c.clone(), 0);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.orphan_root(&c.hash()), parent);

        let children = pool.take_children(&parent);
        assert_eq!(children.len(), 2);
        assert!(children.contains(&a) && children.contains(&b));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&c.hash()));
    }

    #[test]
    fn test_expiry() {
        let mut pool = OrphanPool::new();
        let a = block(Hash256::new([1; 32]), 1);
        pool.add_orphan(a.clone(), 0);
        pool.prune_orphans(ORPHAN_BLOCK_EXPIRE_TIME);
        assert!(pool.contains(&a.hash()));
        pool.prune_orphans(ORPHAN_BLOCK_EXPIRE_TIME + 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut pool = OrphanPool::new();
        let first = block(Hash256::new([9; 32]), 0);
        pool.add_orphan(first.clone(), 0);
        for i in 1..=MAX_ORPHAN_BLOCKS as u32 {
            pool.add_orphan(block(Hash256::new([9; 32]), i), 10);
        }
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);
        assert!(!pool.contains(&first.hash()));
    }
}
