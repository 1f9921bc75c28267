//! Block template generation
//!
//! Templates are built on the current best tip for a chosen algorithm,
//! with the difficulty the chain requires next and a timestamp that
//! satisfies the median-time rule.

use crate::core::block::{Block, BlockHeader, Coinbase, Hash256, TxId};
use crate::core::chain::{BestState, BlockChain};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Template errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Empty payout address")]
    EmptyAddress,
}

// =============================================================================
// Transaction Source
// =============================================================================

/// Supplies the transactions a template commits to
pub trait TxSource: Send + Sync {
    /// Unix time of the last change to the pool
    fn last_updated(&self) -> i64;

    /// Transaction ids to include, in block order
    fn mining_txs(&self) -> Vec<TxId>;
}

/// In-memory transaction source
#[derive(Debug, Default)]
pub struct MemoryTxSource {
    inner: RwLock<MemoryTxs>,
}

#[derive(Debug, Default)]
struct MemoryTxs {
    txs: Vec<TxId>,
    last_updated: i64,
}

impl MemoryTxSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tx(&self, txid: TxId) {
        let mut inner = self.inner.write();
        if !inner.txs.contains(&txid) {
            inner.txs.push(txid);
            inner.last_updated = Utc::now().timestamp();
        }
    }

    /// Drop transactions that made it into a block
    pub fn remove_txs(&self, mined: &[TxId]) {
        let mut inner = self.inner.write();
        let before = inner.txs.len();
        inner.txs.retain(|t| !mined.contains(t));
        if inner.txs.len() != before {
            inner.last_updated = Utc::now().timestamp();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().txs.is_empty()
    }
}

impl TxSource for MemoryTxSource {
    fn last_updated(&self) -> i64 {
        self.inner.read().last_updated
    }

    fn mining_txs(&self) -> Vec<TxId> {
        self.inner.read().txs.clone()
    }
}

// =============================================================================
// Block Template
// =============================================================================

/// An unsolved block and where it goes
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    /// Height the block will have once connected
    pub height: i32,
    /// Resolved algorithm name
    pub algo: String,
}

/// Builds block templates against a chain
pub struct BlkTmplGenerator {
    chain: Arc<BlockChain>,
    tx_source: Arc<dyn TxSource>,
}

impl BlkTmplGenerator {
    pub fn new(chain: Arc<BlockChain>, tx_source: Arc<dyn TxSource>) -> Self {
        Self { chain, tx_source }
    }

    pub fn chain(&self) -> &Arc<BlockChain> {
        &self.chain
    }

    pub fn tx_source(&self) -> &Arc<dyn TxSource> {
        &self.tx_source
    }

    pub fn best_snapshot(&self) -> BestState {
        self.chain.best_snapshot()
    }

    /// Template paying `address` for the next block of `algo`.
    ///
    /// Unknown algorithm names fall back to the era default; `"random"`
    /// picks one of the era's algorithms.
    pub fn new_block_template(
        &self,
        address: &str,
        algo: &str,
    ) -> Result<BlockTemplate, TemplateError> {
        if address.is_empty() {
            return Err(TemplateError::EmptyAddress);
        }

        let best = self.chain.best_snapshot();
        let height = best.height + 1;
        let (version, algo) = self.chain.forks().normalize_algo(algo, height);
        let bits = self.chain.calc_next_required_difficulty(&algo);

        let header = BlockHeader {
            version,
            prev_block: best.hash,
            merkle_root: Hash256::zero(),
            timestamp: Self::block_time(&best),
            bits,
            nonce: 0,
        };
        let coinbase = Coinbase::new(address, height, 0);
        let mut block = Block::new(header, coinbase, self.tx_source.mining_txs());
        block.update_merkle_root();

        log::debug!(
            "Created {} template at height {} with bits {:08x}",
            algo,
            height,
            bits
        );

        Ok(BlockTemplate {
            block,
            height,
            algo,
        })
    }

    /// Set a new extra nonce and recommit the merkle root
    pub fn update_extra_nonce(&self, block: &mut Block, height: i32, extra_nonce: u64) {
        block.coinbase.height = height;
        block.coinbase.extra_nonce = extra_nonce;
        block.update_merkle_root();
    }

    /// Move the timestamp forward to now, never to or below the median time
    pub fn update_block_time(&self, block: &mut Block) {
        let best = self.chain.best_snapshot();
        let timestamp = Self::block_time(&best);
        if timestamp > block.header.timestamp {
            block.header.timestamp = timestamp;
        }
    }

    fn block_time(best: &BestState) -> i64 {
        Utc::now().timestamp().max(best.median_time + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fork::ForkTable;
    use crate::core::params::ChainParams;
    use crate::storage::MemoryStore;

    fn generator() -> (BlkTmplGenerator, Arc<MemoryTxSource>) {
        let chain = BlockChain::new(
            Arc::new(ChainParams::regtest()),
            Arc::new(ForkTable::regtest()),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let txs = Arc::new(MemoryTxSource::new());
        (BlkTmplGenerator::new(Arc::new(chain), txs.clone()), txs)
    }

    #[test]
    fn test_template_builds_on_tip() {
        let (gen, txs) = generator();
        txs.add_tx(Hash256::new([5; 32]));

        let best = gen.best_snapshot();
        let template = gen.new_block_template("miner", "scrypt").unwrap();
        assert_eq!(template.height, 1);
        assert_eq!(template.algo, "scrypt");
        assert_eq!(template.block.header.version, 514);
        assert_eq!(template.block.header.prev_block, best.hash);
        assert_eq!(
            template.block.header.bits,
            gen.chain().calc_next_required_difficulty("scrypt")
        );
        assert!(template.block.header.timestamp > best.median_time);
        assert_eq!(template.block.transactions, vec![Hash256::new([5; 32])]);
        assert!(template.block.verify_merkle_root());
        assert_eq!(template.block.coinbase.height, 1);
    }

    #[test]
    fn test_unknown_algo_uses_default() {
        let (gen, _) = generator();
        let template = gen.new_block_template("miner", "nope").unwrap();
        assert_eq!(template.algo, "sha256d");
        assert_eq!(template.block.header.version, 2);

        let random = gen.new_block_template("miner", "random").unwrap();
        assert!(["sha256d", "scrypt"].contains(&random.algo.as_str()));
    }

    #[test]
    fn test_empty_address_rejected() {
        let (gen, _) = generator();
        assert_eq!(
            gen.new_block_template("", "sha256d").unwrap_err(),
            TemplateError::EmptyAddress
        );
    }

    #[test]
    fn test_extra_nonce_changes_merkle_root() {
        let (gen, _) = generator();
        let mut block = gen.new_block_template("miner", "sha256d").unwrap().block;
        let before = block.header.merkle_root;
        gen.update_extra_nonce(&mut block, 1, 42);
        assert_ne!(block.header.merkle_root, before);
        assert!(block.verify_merkle_root());

        let ts = block.header.timestamp;
        gen.update_block_time(&mut block);
        assert!(block.header.timestamp >= ts);
    }

    #[test]
    fn test_memory_tx_source() {
        let source = MemoryTxSource::new();
        assert!(source.is_empty());
        assert_eq!(source.last_updated(), 0);

        let a = Hash256::new([1; 32]);
        let b = Hash256::new([2; 32]);
        source.add_tx(a);
        source.add_tx(a);
        source.add_tx(b);
        assert_eq!(source.len(), 2);
        assert!(source.last_updated() > 0);

        source.remove_txs(&[a]);
        assert_eq!(source.mining_txs(), vec![b]);
    }
}
