//! Network parameters
//!
//! Constants that differ between mainnet, testnet and regression test
//! networks. Built once at start-up and shared by reference.

use crate::core::block::{Block, BlockHeader, Coinbase, Hash256};
use crate::core::fork::{MAIN_POW_LIMIT_BITS, REGTEST_POW_LIMIT_BITS};
use crate::storage::checkpoint::Checkpoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Network
// =============================================================================

/// Which chain the node follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

// =============================================================================
// Chain Parameters
// =============================================================================

/// Per-network consensus constants
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,

    // Genesis header
    pub genesis_version: i32,
    pub genesis_timestamp: i64,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub genesis_address: String,

    // Legacy retarget window
    pub interval: i64,
    pub max_adjust_down: i64,
    pub max_adjust_up: i64,
    pub target_time_per_block: i64,
    pub averaging_interval: i64,
    pub averaging_target_timespan: i64,
    pub min_actual_timespan: i64,
    pub max_actual_timespan: i64,
    pub retarget_adjustment_factor: i64,

    /// Seconds a block timestamp may run ahead of the local clock
    pub max_future_block_time: i64,
    /// Blocks considered for median time past
    pub median_time_blocks: usize,
}

impl ChainParams {
    fn base(network: Network, genesis_bits: u32, genesis_timestamp: i64) -> Self {
        let interval = 100;
        let max_adjust_down = 10;
        let max_adjust_up = 20;
        let target_time_per_block = 300;
        let averaging_interval = 10;
        let averaging_target_timespan = target_time_per_block * averaging_interval;

        Self {
            network,
            genesis_version: 2,
            genesis_timestamp,
            genesis_bits,
            genesis_nonce: 0,
            genesis_address: "genesis".to_string(),
            interval,
            max_adjust_down,
            max_adjust_up,
            target_time_per_block,
            averaging_interval,
            averaging_target_timespan,
            min_actual_timespan: averaging_target_timespan * (interval - max_adjust_up) / interval,
            max_actual_timespan: averaging_target_timespan * (interval + max_adjust_down)
                / interval,
            retarget_adjustment_factor: 2,
            max_future_block_time: 7200,
            median_time_blocks: 11,
        }
    }

    pub fn mainnet() -> Self {
        Self::base(Network::Mainnet, MAIN_POW_LIMIT_BITS, 1_393_833_600)
    }

    pub fn testnet() -> Self {
        Self::base(Network::Testnet, MAIN_POW_LIMIT_BITS, 1_393_833_601)
    }

    pub fn regtest() -> Self {
        Self::base(Network::Regtest, REGTEST_POW_LIMIT_BITS, 1_393_833_602)
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// The genesis block of this network
    pub fn genesis_block(&self) -> Block {
        let header = BlockHeader {
            version: self.genesis_version,
            prev_block: Hash256::zero(),
            merkle_root: Hash256::zero(),
            timestamp: self.genesis_timestamp,
            bits: self.genesis_bits,
            nonce: self.genesis_nonce,
        };
        let mut block = Block::new(header, Coinbase::new(&self.genesis_address, 0, 0), vec![]);
        block.update_merkle_root();
        block
    }

    /// Hard-coded checkpoints; the genesis block is always pinned
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        let genesis = self.genesis_block();
        vec![Checkpoint::with_timestamp(
            0,
            genesis.hash(),
            self.genesis_timestamp,
        )]
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}
