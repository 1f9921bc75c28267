//! Mining module for block templates and the CPU miner

pub mod miner;
pub mod template;

pub use miner::{CpuMiner, MiningError, SubmitOutcome};
pub use template::{BlkTmplGenerator, BlockTemplate, MemoryTxSource, TemplateError, TxSource};
