//! In-memory block index
//!
//! Every header the node has accepted lives in an arena of [`BlockNode`]s
//! addressed by [`NodeId`]. Parents are referenced by id, so ancestor walks
//! are index lookups and the whole structure sits behind the chain lock
//! without any shared ownership.
//!
//! The index also tracks which nodes changed since the last flush so their
//! records can be written to the block store.

use crate::core::block::{BlockHash, BlockHeader, Hash256};
use crate::core::compact::calc_work;
use crate::core::fork::ForkTable;
use crate::storage::index::IndexRecord;
use crate::storage::StorageError;
use bitflags::bitflags;
use num_bigint::BigUint;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

// =============================================================================
// Node Status
// =============================================================================

bitflags! {
    /// Validation state of a node, persisted with its index record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockStatus: u8 {
        /// The full block is in the store
        const DATA_STORED = 1 << 0;
        /// The block was connected to the main chain
        const VALID = 1 << 1;
        /// The block itself failed validation
        const VALIDATE_FAILED = 1 << 2;
        /// An ancestor failed validation
        const INVALID_ANCESTOR = 1 << 3;
    }
}

impl BlockStatus {
    pub fn known_invalid(&self) -> bool {
        self.intersects(BlockStatus::VALIDATE_FAILED | BlockStatus::INVALID_ANCESTOR)
    }

    pub fn known_valid(&self) -> bool {
        self.contains(BlockStatus::VALID)
    }
}

// =============================================================================
// Block Node
// =============================================================================

/// Stable handle of a node in the index arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A validated header and its position in the block tree
#[derive(Debug, Clone)]
pub struct BlockNode {
    pub hash: BlockHash,
    pub parent: Option<NodeId>,
    pub height: i32,
    pub bits: u32,
    pub version: i32,
    pub timestamp: i64,
    pub status: BlockStatus,
    /// Cumulative work up to and including this node
    pub work_sum: BigUint,
}

// =============================================================================
// Block Index
// =============================================================================

/// Arena of block nodes with hash lookup
#[derive(Debug)]
pub struct BlockIndex {
    forks: Arc<ForkTable>,
    nodes: Vec<BlockNode>,
    by_hash: HashMap<BlockHash, NodeId>,
    dirty: BTreeSet<NodeId>,
}

impl BlockIndex {
    pub fn new(forks: Arc<ForkTable>) -> Self {
        Self {
            forks,
            nodes: Vec::new(),
            by_hash: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn forks(&self) -> &ForkTable {
        &self.forks
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, hash: &BlockHash) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// The node behind a handle issued by this index
    pub fn node(&self, id: NodeId) -> &BlockNode {
        &self.nodes[id.0]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Every handle in insertion order
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Insert a header as a child of `parent`.
    ///
    /// Inserting a hash that is already indexed returns the existing handle
    /// and changes nothing.
    pub fn add(&mut self, header: &BlockHeader, parent: Option<NodeId>, status: BlockStatus) -> NodeId {
        let hash = header.block_hash();
        if let Some(existing) = self.lookup(&hash) {
            return existing;
        }

        let (height, parent_work) = match parent {
            Some(p) => {
                let p = self.node(p);
                (p.height + 1, p.work_sum.clone())
            }
            None => (0, BigUint::default()),
        };
        let work = calc_work(header.bits, height, header.version, &self.forks);

        self.push(BlockNode {
            hash,
            parent,
            height,
            bits: header.bits,
            version: header.version,
            timestamp: header.timestamp,
            status,
            work_sum: parent_work + work,
        })
    }

    fn push(&mut self, node: BlockNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        self.dirty.insert(id);
        id
    }

    // =========================================================================
    // Ancestor Queries
    // =========================================================================

    /// Walk `n` links back along the node's own parent chain
    pub fn relative_ancestor(&self, id: NodeId, n: i32) -> Option<NodeId> {
        if n < 0 {
            return None;
        }
        let mut current = Some(id);
        for _ in 0..n {
            current = self.parent(current?);
        }
        current
    }

    /// The ancestor of `id` at an absolute height
    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let node = self.node(id);
        if height < 0 || height > node.height {
            return None;
        }
        self.relative_ancestor(id, node.height - height)
    }

    /// Nearest node at or before `id` whose header version is `version`.
    ///
    /// `None` means the history ran out before genesis and callers fall
    /// back to the era floor.
    pub fn last_with_algo(&self, id: NodeId, version: i32) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(c) = current {
            if self.node(c).version == version {
                return Some(c);
            }
            current = self.parent(c);
        }
        None
    }

    /// Median timestamp of the last `count` blocks ending at `id`
    pub fn median_time_past(&self, id: NodeId, count: usize) -> i64 {
        let mut timestamps = Vec::with_capacity(count);
        let mut current = Some(id);
        while let Some(c) = current {
            if timestamps.len() >= count {
                break;
            }
            timestamps.push(self.node(c).timestamp);
            current = self.parent(c);
        }

        timestamps.sort_unstable();
        timestamps.get(timestamps.len() / 2).copied().unwrap_or_default()
    }

    /// Last common ancestor of two nodes
    pub fn find_fork(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (Some(a), Some(b));
        while let (Some(x), Some(y)) = (a, b) {
            if x == y {
                return Some(x);
            }
            let (hx, hy) = (self.node(x).height, self.node(y).height);
            if hx >= hy {
                a = self.parent(x);
            }
            if hy >= hx {
                b = self.parent(y);
            }
        }
        None
    }

    /// Every node whose parent chain passes through `id`, excluding `id`
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        // Children always have larger ids than their parents.
        let mut marked = BTreeSet::from([id]);
        let mut found = Vec::new();
        for (i, node) in self.nodes.iter().enumerate().skip(id.0 + 1) {
            if node.parent.map_or(false, |p| marked.contains(&p)) {
                marked.insert(NodeId(i));
                found.push(NodeId(i));
            }
        }
        found
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self, id: NodeId) -> BlockStatus {
        self.node(id).status
    }

    pub fn set_status_flags(&mut self, id: NodeId, flags: BlockStatus) {
        let node = &mut self.nodes[id.0];
        let updated = node.status | flags;
        if updated != node.status {
            node.status = updated;
            self.dirty.insert(id);
        }
    }

    pub fn unset_status_flags(&mut self, id: NodeId, flags: BlockStatus) {
        let node = &mut self.nodes[id.0];
        let updated = node.status - flags;
        if updated != node.status {
            node.status = updated;
            self.dirty.insert(id);
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Persisted form of a node
    pub fn record(&self, id: NodeId) -> IndexRecord {
        let node = self.node(id);
        IndexRecord {
            height: node.height,
            hash: node.hash,
            parent: node
                .parent
                .map(|p| self.node(p).hash)
                .unwrap_or_else(Hash256::zero),
            bits: node.bits,
            version: node.version,
            timestamp: node.timestamp,
            status: node.status.bits(),
        }
    }

    /// Records of nodes changed since the last [`clear_dirty`](Self::clear_dirty)
    pub fn dirty_records(&self) -> Vec<IndexRecord> {
        self.dirty.iter().map(|id| self.record(*id)).collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Rebuild an index from persisted records.
    ///
    /// Records may arrive in any order and repeat; the last record for a
    /// hash wins. Status and cumulative work are restored without
    /// re-validating the blocks.
    pub fn from_records(
        forks: Arc<ForkTable>,
        records: Vec<IndexRecord>,
    ) -> Result<Self, StorageError> {
        let mut latest: HashMap<BlockHash, IndexRecord> = HashMap::new();
        for record in records {
            latest.insert(record.hash, record);
        }

        let mut ordered: Vec<IndexRecord> = latest.into_values().collect();
        ordered.sort_by_key(|r| (r.height, r.hash));

        let mut index = Self::new(forks);
        for record in ordered {
            let parent = if record.height == 0 {
                None
            } else {
                let parent = index.lookup(&record.parent).ok_or_else(|| {
                    StorageError::CorruptIndex(format!(
                        "block {} at height {} references unknown parent {}",
                        record.hash, record.height, record.parent
                    ))
                })?;
                if index.node(parent).height + 1 != record.height {
                    return Err(StorageError::CorruptIndex(format!(
                        "block {} claims height {} but its parent is at {}",
                        record.hash,
                        record.height,
                        index.node(parent).height
                    )));
                }
                Some(parent)
            };

            let parent_work = parent
                .map(|p| index.node(p).work_sum.clone())
                .unwrap_or_default();
            let work = calc_work(record.bits, record.height, record.version, &index.forks);

            index.push(BlockNode {
                hash: record.hash,
                parent,
                height: record.height,
                bits: record.bits,
                version: record.version,
                timestamp: record.timestamp,
                status: BlockStatus::from_bits_truncate(record.status),
                work_sum: parent_work + work,
            });
        }

        index.clear_dirty();
        Ok(index)
    }
}

// =============================================================================
// Chain View
// =============================================================================

/// The main chain as a height-indexed list of nodes
#[derive(Debug, Default, Clone)]
pub struct ChainView {
    nodes: Vec<NodeId>,
}

impl ChainView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }

    /// Height of the tip, -1 when empty
    pub fn height(&self) -> i32 {
        self.nodes.len() as i32 - 1
    }

    pub fn node_by_height(&self, height: i32) -> Option<NodeId> {
        if height < 0 {
            return None;
        }
        self.nodes.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        self.node_by_height(index.node(id).height) == Some(id)
    }

    /// Point of divergence between the view and the chain ending at `id`
    pub fn find_fork(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(c) = current {
            if self.contains(index, c) {
                return Some(c);
            }
            current = index.parent(c);
        }
        None
    }

    /// Make `id` the tip, replacing every entry past the fork point
    pub fn set_tip(&mut self, index: &BlockIndex, id: NodeId) {
        let height = index.node(id).height;
        self.nodes.truncate(height as usize + 1);

        let mut current = Some(id);
        while let Some(c) = current {
            let h = index.node(c).height as usize;
            if h < self.nodes.len() {
                if self.nodes[h] == c {
                    break;
                }
                self.nodes[h] = c;
            } else {
                self.nodes.resize(h + 1, c);
            }
            current = index.parent(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fork::REGTEST_POW_LIMIT_BITS;

    fn header(prev: BlockHash, version: i32, timestamp: i64) -> BlockHeader {
        BlockHeader {
            version,
            prev_block: prev,
            merkle_root: Hash256::zero(),
            timestamp,
            bits: REGTEST_POW_LIMIT_BITS,
            nonce: 0,
        }
    }

    /// Builds a straight chain with the given versions, genesis first.
    fn chain(versions: &[i32]) -> (BlockIndex, Vec<NodeId>) {
        let mut index = BlockIndex::new(Arc::new(ForkTable::regtest()));
        let mut ids = Vec::new();
        let mut prev = Hash256::zero();
        for (i, v) in versions.iter().enumerate() {
            let h = header(prev, *v, 1000 + i as i64 * 60);
            let id = index.add(&h, ids.last().copied(), BlockStatus::DATA_STORED);
            prev = h.block_hash();
            ids.push(id);
        }
        (index, ids)
    }

    #[test]
    fn test_add_is_idempotent() {
        let (mut index, ids) = chain(&[2, 2]);
        let h = header(index.node(ids[1]).hash, 2, 5000);
        let a = index.add(&h, Some(ids[1]), BlockStatus::DATA_STORED);
        let b = index.add(&h, Some(ids[1]), BlockStatus::DATA_STORED);
        assert_eq!(a, b);
        assert_eq!(index.len(), 3);
        assert_eq!(index.node(a).height, 2);
        assert_eq!(index.lookup(&h.block_hash()), Some(a));
    }

    #[test]
    fn test_relative_ancestor_stops_at_genesis() {
        let (index, ids) = chain(&[2, 2, 2, 2]);
        assert_eq!(index.relative_ancestor(ids[3], 0), Some(ids[3]));
        assert_eq!(index.relative_ancestor(ids[3], 3), Some(ids[0]));
        assert_eq!(index.relative_ancestor(ids[3], 4), None);
        assert_eq!(index.relative_ancestor(ids[3], 100), None);
        assert_eq!(index.ancestor(ids[3], 1), Some(ids[1]));
        assert_eq!(index.ancestor(ids[3], 4), None);
    }

    #[test]
    fn test_last_with_algo() {
        let (index, ids) = chain(&[2, 514, 2, 2, 514, 2]);
        assert_eq!(index.last_with_algo(ids[5], 2), Some(ids[5]));
        assert_eq!(index.last_with_algo(ids[5], 514), Some(ids[4]));
        assert_eq!(index.last_with_algo(ids[3], 514), Some(ids[1]));
        assert_eq!(index.last_with_algo(ids[0], 514), None);
        assert_eq!(index.last_with_algo(ids[5], 99), None);
    }

    #[test]
    fn test_median_time_past() {
        let (index, ids) = chain(&[2; 5]);
        // Timestamps 1000, 1060, 1120, 1180, 1240.
        assert_eq!(index.median_time_past(ids[4], 11), 1120);
        assert_eq!(index.median_time_past(ids[4], 2), 1240);
        assert_eq!(index.median_time_past(ids[0], 11), 1000);
    }

    #[test]
    fn test_work_accumulates() {
        let (index, ids) = chain(&[2, 2, 2]);
        assert!(index.node(ids[2]).work_sum > index.node(ids[1]).work_sum);
        assert!(index.node(ids[1]).work_sum > index.node(ids[0]).work_sum);
    }

    #[test]
    fn test_find_fork_and_descendants() {
        let (mut index, ids) = chain(&[2, 2, 2]);
        let side = header(index.node(ids[1]).hash, 514, 9999);
        let side_id = index.add(&side, Some(ids[1]), BlockStatus::DATA_STORED);

        assert_eq!(index.find_fork(ids[2], side_id), Some(ids[1]));
        assert_eq!(index.find_fork(ids[2], ids[0]), Some(ids[0]));

        let below = index.descendants(ids[1]);
        assert_eq!(below, vec![ids[2], side_id]);
    }

    #[test]
    fn test_status_changes_mark_dirty() {
        let (mut index, ids) = chain(&[2, 2]);
        assert_eq!(index.dirty_records().len(), 2);
        index.clear_dirty();
        assert!(index.dirty_records().is_empty());

        index.set_status_flags(ids[1], BlockStatus::DATA_STORED);
        assert!(index.dirty_records().is_empty());

        index.set_status_flags(ids[1], BlockStatus::VALIDATE_FAILED);
        let dirty = index.dirty_records();
        assert_eq!(dirty.len(), 1);
        assert!(BlockStatus::from_bits_truncate(dirty[0].status).known_invalid());

        index.unset_status_flags(ids[1], BlockStatus::VALIDATE_FAILED);
        assert!(!index.status(ids[1]).known_invalid());
    }

    #[test]
    fn test_rebuild_from_records() {
        let (mut index, ids) = chain(&[2, 514, 2]);
        index.set_status_flags(ids[2], BlockStatus::VALID);

        let mut records = index.dirty_records();
        records.reverse();
        // A stale duplicate earlier in the log is superseded.
        let mut stale = index.record(ids[2]);
        stale.status = BlockStatus::DATA_STORED.bits();
        records.insert(0, stale);

        let rebuilt = BlockIndex::from_records(Arc::new(ForkTable::regtest()), records).unwrap();
        assert_eq!(rebuilt.len(), 3);
        let tip = rebuilt.lookup(&index.node(ids[2]).hash).unwrap();
        assert_eq!(rebuilt.node(tip).height, 2);
        assert!(rebuilt.status(tip).known_valid());
        assert_eq!(rebuilt.node(tip).work_sum, index.node(ids[2]).work_sum);
        assert!(rebuilt.dirty_records().is_empty());
    }

    #[test]
    fn test_rebuild_rejects_orphaned_record() {
        let (index, ids) = chain(&[2, 2, 2]);
        let records = vec![index.record(ids[0]), index.record(ids[2])];
        let err = BlockIndex::from_records(Arc::new(ForkTable::regtest()), records).unwrap_err();
        assert!(matches!(err, StorageError::CorruptIndex(_)));
    }

    #[test]
    fn test_chain_view_reorg() {
        let (mut index, ids) = chain(&[2, 2, 2]);
        let mut view = ChainView::new();
        assert_eq!(view.height(), -1);
        view.set_tip(&index, ids[2]);
        assert_eq!(view.height(), 2);
        assert_eq!(view.node_by_height(1), Some(ids[1]));

        let s1 = header(index.node(ids[1]).hash, 514, 7000);
        let s1_id = index.add(&s1, Some(ids[1]), BlockStatus::DATA_STORED);
        let s2 = header(s1.block_hash(), 514, 7060);
        let s2_id = index.add(&s2, Some(s1_id), BlockStatus::DATA_STORED);

        assert_eq!(view.find_fork(&index, s2_id), Some(ids[1]));
        view.set_tip(&index, s2_id);
        assert_eq!(view.tip(), Some(s2_id));
        assert_eq!(view.node_by_height(2), Some(s1_id));
        assert!(!view.contains(&index, ids[2]));
        assert!(view.contains(&index, ids[0]));

        view.set_tip(&index, ids[1]);
        assert_eq!(view.height(), 1);
    }
}
