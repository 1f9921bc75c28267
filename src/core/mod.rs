//! Core consensus components
//!
//! This module contains the fundamental building blocks:
//! - Compact target encoding and work calculation
//! - Hard-fork eras and their proof-of-work algorithms
//! - Blocks and headers
//! - The block index arena and main chain view
//! - Difficulty retargeting (legacy averaging and Plan 9)
//! - Block validation and the acceptance pipeline

pub mod block;
pub mod block_index;
pub mod chain;
pub mod compact;
pub mod difficulty;
pub mod fork;
pub mod orphan;
pub mod params;
pub mod validation;

pub use block::{Block, BlockHash, BlockHeader, Coinbase, Hash256, TxId, BLOCK_HEADER_SIZE};
pub use block_index::{BlockIndex, BlockNode, BlockStatus, ChainView, NodeId};
pub use chain::{BestState, BlockChain, ChainError, NodeInfo, NotificationSink, ProcessOutcome};
pub use compact::{big_to_compact, calc_work, compact_to_big, hash_to_big};
pub use difficulty::{DifficultyEngine, Retarget};
pub use fork::{AlgoParams, ForkTable, ForkTableError, HardForkEra};
pub use orphan::{OrphanPool, MAX_ORPHAN_BLOCKS};
pub use params::{ChainParams, Network};
pub use validation::{
    check_block_sanity, check_proof_of_work, BehaviorFlags, ChainContext, ConsensusValidator,
    ContextValidator, ErrorKind, RuleError,
};
