//! Block chain and acceptance pipeline
//!
//! [`BlockChain`] owns the block index, the main chain view, the orphan
//! pool and the per-algorithm difficulty adjustment cache behind a single
//! exclusive lock. Every mutation happens under that lock; readers get
//! owned snapshots and never hold a reference into chain state.
//!
//! Accepted-block notifications are delivered only after the lock is
//! released, so subscribers may call back into the chain.

use crate::core::block::{Block, BlockHash};
use crate::core::block_index::{BlockIndex, BlockStatus, ChainView, NodeId};
use crate::core::compact::compact_to_big;
use crate::core::difficulty::DifficultyEngine;
use crate::core::fork::ForkTable;
use crate::core::orphan::OrphanPool;
use crate::core::params::ChainParams;
use crate::core::validation::{
    check_block_sanity, BehaviorFlags, ChainContext, ConsensusValidator, ContextValidator,
    ErrorKind, RuleError,
};
use crate::storage::checkpoint::CheckpointManager;
use crate::storage::{BlockStore, StorageError};
use chrono::Utc;
use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Chain errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Rule violation: {0}")]
    Rule(#[from] RuleError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Unknown block: {0}")]
    UnknownBlock(BlockHash),
}

impl ChainError {
    pub fn is_rule_error(&self) -> bool {
        matches!(self, ChainError::Rule(_))
    }

    pub fn rule_kind(&self) -> Option<ErrorKind> {
        match self {
            ChainError::Rule(e) => Some(e.kind),
            _ => None,
        }
    }
}

// =============================================================================
// Notifications and snapshots
// =============================================================================

/// Receives every block accepted into the index
pub trait NotificationSink: Send + Sync {
    fn on_block_accepted(&self, block: &Block);
}

/// Result of [`BlockChain::process_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The block extends or became the main chain
    pub is_main_chain: bool,
    /// The block waits in the orphan pool for its parent
    pub is_orphan: bool,
}

/// Owned copy of the main chain tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestState {
    pub hash: BlockHash,
    pub height: i32,
    pub bits: u32,
    pub version: i32,
    pub timestamp: i64,
    /// Median time past of the tip
    pub median_time: i64,
    pub total_work: BigUint,
}

/// Owned copy of one index node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub hash: BlockHash,
    pub parent: Option<BlockHash>,
    pub height: i32,
    pub bits: u32,
    pub version: i32,
    pub timestamp: i64,
    pub status: BlockStatus,
    pub work_sum: BigUint,
    pub on_main_chain: bool,
}

// =============================================================================
// Chain State
// =============================================================================

struct ChainState {
    index: BlockIndex,
    best_chain: ChainView,
    orphans: OrphanPool,
    /// Last Plan 9 adjustment factor per algorithm name
    difficulty_adjustments: HashMap<String, f64>,
}

impl ChainState {
    fn tip(&self) -> NodeId {
        // The view always holds at least the genesis block.
        self.best_chain.tip().unwrap_or_else(|| {
            unreachable!("chain view is initialised with genesis")
        })
    }
}

/// Heaviest node that is not known to be invalid; earliest wins ties
fn best_candidate(index: &BlockIndex) -> Option<NodeId> {
    let mut best: Option<NodeId> = None;
    for id in index.ids() {
        let node = index.node(id);
        if node.status.known_invalid() {
            continue;
        }
        match best {
            Some(b) if index.node(b).work_sum >= node.work_sum => {}
            _ => best = Some(id),
        }
    }
    best
}

// =============================================================================
// Block Chain
// =============================================================================

/// The consensus core
pub struct BlockChain {
    params: Arc<ChainParams>,
    forks: Arc<ForkTable>,
    store: Arc<dyn BlockStore>,
    validator: Box<dyn ContextValidator>,
    checkpoints: CheckpointManager,
    state: Mutex<ChainState>,
    subscribers: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl BlockChain {
    /// Open a chain on `store` with the network's consensus rules
    pub fn new(
        params: Arc<ChainParams>,
        forks: Arc<ForkTable>,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self, ChainError> {
        Self::with_validator(params, forks, store, Box::new(ConsensusValidator))
    }

    /// Open a chain with a custom context validator.
    ///
    /// A store with index records is rebuilt without re-validation; an
    /// empty store is initialised with the genesis block.
    pub fn with_validator(
        params: Arc<ChainParams>,
        forks: Arc<ForkTable>,
        store: Arc<dyn BlockStore>,
        validator: Box<dyn ContextValidator>,
    ) -> Result<Self, ChainError> {
        let checkpoints = CheckpointManager::from_checkpoints(params.checkpoints());
        let genesis = params.genesis_block();
        let records = store.load_index()?;

        let (mut index, tip) = if records.is_empty() {
            let mut index = BlockIndex::new(forks.clone());
            store.store_block(&genesis)?;
            let id = index.add(
                &genesis.header,
                None,
                BlockStatus::DATA_STORED | BlockStatus::VALID,
            );
            store.flush_index_metadata(&index.dirty_records())?;
            index.clear_dirty();
            log::info!("Initialised {} chain with genesis {}", params.network, genesis.hash());
            (index, id)
        } else {
            let index = BlockIndex::from_records(forks.clone(), records)?;
            match index.lookup(&genesis.hash()) {
                Some(id) if index.node(id).height == 0 => {}
                _ => {
                    return Err(StorageError::CorruptIndex(format!(
                        "stored index does not contain the {} genesis block",
                        params.network
                    ))
                    .into())
                }
            }
            let tip = best_candidate(&index).ok_or_else(|| {
                StorageError::CorruptIndex("no valid block in stored index".to_string())
            })?;
            log::info!(
                "Loaded block index with {} nodes, tip {} at height {}",
                index.len(),
                index.node(tip).hash,
                index.node(tip).height
            );
            (index, tip)
        };

        let mut best_chain = ChainView::new();
        best_chain.set_tip(&index, tip);
        index.clear_dirty();

        Ok(Self {
            params,
            forks,
            store,
            validator,
            checkpoints,
            state: Mutex::new(ChainState {
                index,
                best_chain,
                orphans: OrphanPool::new(),
                difficulty_adjustments: HashMap::new(),
            }),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn forks(&self) -> &ForkTable {
        &self.forks
    }

    /// Register a sink for accepted blocks
    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        self.subscribers.write().push(sink);
    }

    fn notify(&self, accepted: &[Block]) {
        let subscribers = self.subscribers.read().clone();
        for block in accepted {
            for sink in &subscribers {
                sink.on_block_accepted(block);
            }
        }
    }

    // =========================================================================
    // Block Processing
    // =========================================================================

    /// Validate and accept a block, or park it as an orphan.
    ///
    /// Orphans waiting on the accepted block are connected recursively.
    pub fn process_block(
        &self,
        block: Block,
        flags: BehaviorFlags,
    ) -> Result<ProcessOutcome, ChainError> {
        let now = Utc::now().timestamp();
        let mut accepted = Vec::new();

        let outcome = {
            let mut state = self.state.lock();
            self.process_locked(&mut state, block, flags, now, &mut accepted)?
        };

        self.notify(&accepted);
        Ok(outcome)
    }

    fn process_locked(
        &self,
        state: &mut ChainState,
        block: Block,
        flags: BehaviorFlags,
        now: i64,
        accepted: &mut Vec<Block>,
    ) -> Result<ProcessOutcome, ChainError> {
        let hash = block.hash();
        if state.index.contains(&hash) {
            return Err(RuleError::new(
                ErrorKind::DuplicateBlock,
                format!("already have block {}", hash),
            )
            .into());
        }
        if state.orphans.contains(&hash) {
            return Err(RuleError::new(
                ErrorKind::DuplicateBlock,
                format!("already have block (orphan) {}", hash),
            )
            .into());
        }

        let parent = state.index.lookup(&block.header.prev_block);
        let tip_height = state.index.node(state.tip()).height;
        let height = parent
            .map(|p| state.index.node(p).height + 1)
            .unwrap_or(tip_height + 1);

        check_block_sanity(&block, height, &self.forks, &self.params, flags, now)?;
        self.check_against_checkpoint(state, &block, height, tip_height, flags)?;

        if parent.is_none() {
            log::debug!(
                "Adding orphan block {} with parent {}",
                hash,
                block.header.prev_block
            );
            state.orphans.add_orphan(block, now);
            return Ok(ProcessOutcome {
                is_main_chain: false,
                is_orphan: true,
            });
        }

        let is_main_chain = self.maybe_accept_block(state, &block, flags)?;
        accepted.push(block);
        self.process_orphans(state, hash, flags, accepted);

        Ok(ProcessOutcome {
            is_main_chain,
            is_orphan: false,
        })
    }

    /// Reject blocks that could not follow the latest checkpoint we hold
    fn check_against_checkpoint(
        &self,
        state: &ChainState,
        block: &Block,
        height: i32,
        tip_height: i32,
        flags: BehaviorFlags,
    ) -> Result<(), ChainError> {
        let checkpoint = self
            .checkpoints
            .latest_before(tip_height)
            .and_then(|cp| state.index.lookup(&cp.hash));
        let Some(checkpoint) = checkpoint else {
            return Ok(());
        };
        let checkpoint = state.index.node(checkpoint);

        let header = &block.header;
        if header.timestamp < checkpoint.timestamp {
            return Err(RuleError::new(
                ErrorKind::CheckpointTimeTooOld,
                format!(
                    "block {} has timestamp {} before the last checkpoint timestamp {}",
                    block.hash(),
                    header.timestamp,
                    checkpoint.timestamp
                ),
            )
            .into());
        }

        if !flags.contains(BehaviorFlags::FAST_ADD) {
            let engine = DifficultyEngine::new(&self.params, &self.forks, &state.index);
            let duration = header.timestamp - checkpoint.timestamp;
            let required = engine.easiest_difficulty(checkpoint.bits, duration, height);
            if compact_to_big(header.bits) > compact_to_big(required) {
                return Err(RuleError::new(
                    ErrorKind::DifficultyTooLow,
                    format!(
                        "block target difficulty of {:08x} is too low when compared to the previous checkpoint",
                        header.bits
                    ),
                )
                .into());
            }
        }

        Ok(())
    }

    /// Accept orphans descending from `parent`, breadth first
    fn process_orphans(
        &self,
        state: &mut ChainState,
        parent: BlockHash,
        flags: BehaviorFlags,
        accepted: &mut Vec<Block>,
    ) {
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            for orphan in state.orphans.take_children(&parent) {
                let hash = orphan.hash();
                match self.maybe_accept_block(state, &orphan, flags) {
                    Ok(_) => {
                        log::debug!("Accepted orphan block {}", hash);
                        accepted.push(orphan);
                        queue.push_back(hash);
                    }
                    Err(e) => log::warn!("Orphan block {} rejected: {}", hash, e),
                }
            }
        }
    }

    /// Link a block whose parent is indexed; returns whether it is on the
    /// main chain afterwards. Must run under the chain lock.
    fn maybe_accept_block(
        &self,
        state: &mut ChainState,
        block: &Block,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        let prev_hash = block.header.prev_block;
        let parent = state.index.lookup(&prev_hash).ok_or_else(|| {
            RuleError::new(
                ErrorKind::PreviousBlockUnknown,
                format!("previous block {} is unknown", prev_hash),
            )
        })?;
        if state.index.status(parent).known_invalid() {
            return Err(RuleError::new(
                ErrorKind::InvalidAncestorBlock,
                format!("previous block {} is known to be invalid", prev_hash),
            )
            .into());
        }

        // Context checks only run once the block's algorithm has history.
        if state
            .index
            .last_with_algo(parent, block.header.version)
            .is_some()
        {
            let ctx = ChainContext {
                params: &self.params,
                forks: &self.forks,
                index: &state.index,
                checkpoints: &self.checkpoints,
            };
            self.validator
                .check_block_context(&ctx, block, parent, flags)?;
        } else {
            log::debug!(
                "No ancestor with version {} for block {}, skipping context checks",
                block.header.version,
                block.hash()
            );
        }

        self.store.store_block(block)?;

        let id = state
            .index
            .add(&block.header, Some(parent), BlockStatus::DATA_STORED);
        self.flush_index(state)?;

        self.connect_best_chain(state, id)
    }

    fn flush_index(&self, state: &mut ChainState) -> Result<(), ChainError> {
        let records = state.index.dirty_records();
        self.store.flush_index_metadata(&records)?;
        state.index.clear_dirty();
        Ok(())
    }

    /// Select the heaviest chain, reorganising the view if `id` overtakes it
    fn connect_best_chain(&self, state: &mut ChainState, id: NodeId) -> Result<bool, ChainError> {
        let tip = state.tip();
        let parent = state.index.parent(id);

        if parent == Some(tip) {
            state.index.set_status_flags(id, BlockStatus::VALID);
            state.best_chain.set_tip(&state.index, id);
            self.flush_index(state)?;
            return Ok(true);
        }

        if state.index.node(id).work_sum <= state.index.node(tip).work_sum {
            let node = state.index.node(id);
            log::debug!(
                "Block {} at height {} extends a side chain",
                node.hash,
                node.height
            );
            return Ok(false);
        }

        self.reorganize(state, id)?;
        Ok(true)
    }

    fn reorganize(&self, state: &mut ChainState, new_tip: NodeId) -> Result<(), ChainError> {
        let old_tip = state.tip();
        let fork = state.best_chain.find_fork(&state.index, new_tip);

        let fork_height = fork.map(|f| state.index.node(f).height).unwrap_or(-1);
        let mut attach = Vec::new();
        let mut current = Some(new_tip);
        while let Some(c) = current {
            if state.index.node(c).height <= fork_height {
                break;
            }
            attach.push(c);
            current = state.index.parent(c);
        }
        for id in &attach {
            state.index.set_status_flags(*id, BlockStatus::VALID);
        }

        let old = state.index.node(old_tip);
        let new = state.index.node(new_tip);
        log::info!(
            "REORGANIZE: chain forks at height {}; old tip {} (height {}), new tip {} (height {})",
            fork_height,
            old.hash,
            old.height,
            new.hash,
            new.height
        );

        state.best_chain.set_tip(&state.index, new_tip);
        self.flush_index(state)
    }

    /// Mark a block invalid, along with all its descendants, and move the
    /// tip to the heaviest remaining valid node.
    pub fn invalidate_block(&self, hash: &BlockHash) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let id = state
            .index
            .lookup(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;
        if state.index.node(id).height == 0 {
            return Err(RuleError::new(
                ErrorKind::BadCheckpoint,
                "the genesis block cannot be invalidated",
            )
            .into());
        }

        state.index.set_status_flags(id, BlockStatus::VALIDATE_FAILED);
        state.index.unset_status_flags(id, BlockStatus::VALID);
        for descendant in state.index.descendants(id) {
            state
                .index
                .set_status_flags(descendant, BlockStatus::INVALID_ANCESTOR);
            state.index.unset_status_flags(descendant, BlockStatus::VALID);
        }
        log::info!("Invalidated block {} and its descendants", hash);

        let tip = state.tip();
        if state.index.status(tip).known_invalid() {
            let best = best_candidate(&state.index).ok_or_else(|| {
                RuleError::new(ErrorKind::InvalidAncestorBlock, "no valid block remains")
            })?;
            self.reorganize(&mut state, best)?;
        } else {
            self.flush_index(&mut state)?;
        }
        Ok(())
    }

    // =========================================================================
    // Difficulty
    // =========================================================================

    /// Required bits for the next block of `algo` on the main chain.
    ///
    /// A Plan 9 adjustment factor produced on the way is cached for the
    /// miner.
    pub fn calc_next_required_difficulty(&self, algo: &str) -> u32 {
        let mut state = self.state.lock();
        let tip = state.tip();
        let retarget =
            DifficultyEngine::new(&self.params, &self.forks, &state.index).next_required(Some(tip), algo);
        if let Some(adjustment) = retarget.adjustment {
            let height = state.index.node(tip).height + 1;
            let (_, name) = self.forks.normalize_algo(algo, height);
            state.difficulty_adjustments.insert(name, adjustment);
        }
        retarget.bits
    }

    /// Last cached Plan 9 adjustment factor for an algorithm
    pub fn difficulty_adjustment(&self, algo: &str) -> Option<f64> {
        self.state.lock().difficulty_adjustments.get(algo).copied()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn best_snapshot(&self) -> BestState {
        let state = self.state.lock();
        let tip = state.tip();
        let node = state.index.node(tip);
        BestState {
            hash: node.hash,
            height: node.height,
            bits: node.bits,
            version: node.version,
            timestamp: node.timestamp,
            median_time: state
                .index
                .median_time_past(tip, self.params.median_time_blocks),
            total_work: node.work_sum.clone(),
        }
    }

    pub fn block_hash_by_height(&self, height: i32) -> Option<BlockHash> {
        let state = self.state.lock();
        state
            .best_chain
            .node_by_height(height)
            .map(|id| state.index.node(id).hash)
    }

    pub fn node_info(&self, hash: &BlockHash) -> Option<NodeInfo> {
        let state = self.state.lock();
        let id = state.index.lookup(hash)?;
        let node = state.index.node(id);
        Some(NodeInfo {
            hash: node.hash,
            parent: node.parent.map(|p| state.index.node(p).hash),
            height: node.height,
            bits: node.bits,
            version: node.version,
            timestamp: node.timestamp,
            status: node.status,
            work_sum: node.work_sum.clone(),
            on_main_chain: state.best_chain.contains(&state.index, id),
        })
    }

    pub fn have_block(&self, hash: &BlockHash) -> bool {
        let state = self.state.lock();
        state.index.contains(hash) || state.orphans.contains(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.state.lock().orphans.len()
    }

    pub fn index_len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn fetch_block(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError> {
        Ok(self.store.fetch_block(hash)?)
    }
}
