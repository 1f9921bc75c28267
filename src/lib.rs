//! Multialgo-Chain: a multi-algorithm proof-of-work consensus core
//!
//! This crate provides:
//! - Compact target encoding and per-algorithm work weighting
//! - Height-scoped hard-fork eras, each with its own algorithm set
//! - An arena-backed block index with main chain selection by total work
//! - Difficulty retargeting: legacy per-algorithm averaging and the
//!   Plan 9 cubic blend
//! - A block acceptance pipeline with orphan handling and reorganisation
//! - A multi-worker CPU miner with hash rate monitoring
//!
//! # Example
//!
//! ```rust
//! use multialgo_chain::core::{BlockChain, ChainParams, ForkTable};
//! use multialgo_chain::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! let chain = BlockChain::new(
//!     Arc::new(ChainParams::regtest()),
//!     Arc::new(ForkTable::regtest()),
//!     Arc::new(MemoryStore::new()),
//! )
//! .unwrap();
//!
//! let best = chain.best_snapshot();
//! assert_eq!(best.height, 0);
//! println!("Next sha256d bits: {:08x}", chain.calc_next_required_difficulty("sha256d"));
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, MiningConfig, NodeConfig};
pub use core::{
    Block, BlockChain, BlockHash, BlockHeader, ChainError, ChainParams, ErrorKind, ForkTable,
    Network, RuleError,
};
pub use mining::{CpuMiner, SubmitOutcome};
pub use storage::{BlockStore, FileStore, MemoryStore};
