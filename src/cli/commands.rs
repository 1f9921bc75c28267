//! CLI commands for the consensus core
//!
//! Implements all command handlers for the CLI interface.

use crate::config::NodeConfig;
use crate::core::{
    big_to_compact, calc_work, compact_to_big, BlockChain, ChainParams, ForkTable,
};
use crate::mining::{CpuMiner, MemoryTxSource};
use crate::storage::FileStore;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub config: NodeConfig,
    pub chain: Arc<BlockChain>,
    pub tx_source: Arc<MemoryTxSource>,
}

impl AppState {
    /// Open (or initialise) the chain for the configured network
    pub fn new(config: NodeConfig) -> CliResult<Self> {
        let params = Arc::new(ChainParams::for_network(config.network));
        let forks = Arc::new(ForkTable::for_network(config.network));
        let store = Arc::new(FileStore::new(config.storage_config())?);

        log::info!(
            "Opening {} chain in {:?}",
            config.network,
            config.network_data_dir()
        );
        let chain = Arc::new(BlockChain::new(params, forks, store)?);

        Ok(Self {
            config,
            chain,
            tx_source: Arc::new(MemoryTxSource::new()),
        })
    }

    fn miner(&self, address: Option<&str>, algo: Option<&str>, workers: Option<i32>) -> CpuMiner {
        let mut mining = self.config.mining.clone();
        if let Some(address) = address {
            mining.addresses = vec![address.to_string()];
        }
        if let Some(algo) = algo {
            mining.algo = algo.to_string();
        }
        if let Some(workers) = workers {
            mining.workers = workers;
        }
        CpuMiner::new(self.chain.clone(), self.tx_source.clone(), &mining)
    }
}

fn format_time(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Display the best chain state
pub fn cmd_info(state: &AppState) -> CliResult<()> {
    let best = state.chain.best_snapshot();
    let forks = state.chain.forks();
    let next = best.height + 1;
    let era = forks.era(next);

    println!("⛓️  Chain Info ({})", state.config.network);
    println!("   ├─ Height: {}", best.height);
    println!("   ├─ Tip: {}", best.hash);
    println!("   ├─ Bits: {:08x}", best.bits);
    println!(
        "   ├─ Algorithm: {}",
        forks.algo_name(best.version, best.height).unwrap_or("unknown")
    );
    println!("   ├─ Time: {}", format_time(best.timestamp));
    println!("   ├─ Median time: {}", format_time(best.median_time));
    println!("   ├─ Total work: {}", best.total_work);
    println!("   ├─ Orphans: {}", state.chain.orphan_count());
    println!("   └─ Next block era: {} ({})", era.number, era.name);

    println!("\n🎯 Next required difficulty:");
    let names: Vec<&String> = era.algos.keys().collect();
    for (i, name) in names.iter().enumerate() {
        let branch = if i + 1 == names.len() { "└─" } else { "├─" };
        let bits = state.chain.calc_next_required_difficulty(name);
        match state.chain.difficulty_adjustment(name) {
            Some(adjustment) => println!("   {} {:<10} {:08x} (adj {:.4})", branch, name, bits, adjustment),
            None => println!("   {} {:<10} {:08x}", branch, name, bits),
        }
    }

    Ok(())
}

/// List the hard-fork eras of a network
pub fn cmd_eras(forks: &ForkTable) -> CliResult<()> {
    println!("🍴 Hard-fork eras{}:", if forks.is_testnet() { " (testnet)" } else { "" });
    for era in forks.eras() {
        let activation = forks.activation_height(era.number).unwrap_or_default();
        println!("\n   Era {}: {}", era.number, era.name);
        println!("   ├─ Activation height: {}", activation);
        println!("   ├─ Floor: {:08x}", era.pow_limit_bits);
        println!("   ├─ Target time per block: {}s", era.target_time_per_block);
        println!("   ├─ Averaging interval: {}", era.averaging_interval);
        println!("   ├─ Default algorithm: {}", era.default_algo);
        println!("   └─ Algorithms:");
        for (version, name) in &era.algo_vers {
            if let Some(algo) = era.algos.get(name) {
                println!(
                    "      • {:<10} version {:<4} min bits {:08x}",
                    name, version, algo.min_bits
                );
            }
        }
    }
    Ok(())
}

/// Decode a compact target
pub fn cmd_bits(forks: &ForkTable, bits: &str, height: i32, algo: &str) -> CliResult<()> {
    let bits = u32::from_str_radix(bits.trim_start_matches("0x"), 16)?;
    let target = compact_to_big(bits);
    let version = forks.normalize_algo(algo, height).0;

    println!("🎯 Compact bits {:08x}", bits);
    println!("   ├─ Target: {:064x}", target);
    println!("   ├─ Re-encoded: {:08x}", big_to_compact(&target));
    println!(
        "   └─ Work ({} at height {}): {}",
        algo,
        height,
        calc_work(bits, height, version, forks)
    );
    Ok(())
}

/// Mine a fixed number of blocks
pub async fn cmd_generate(
    state: &AppState,
    count: u32,
    address: Option<&str>,
    algo: Option<&str>,
) -> CliResult<()> {
    let miner = state.miner(address, algo, Some(1));
    println!("⛏️  Generating {} {} block(s)...", count, miner.algo());

    let hashes = miner.generate_n_blocks(count).await?;
    for hash in &hashes {
        if let Some(info) = state.chain.node_info(hash) {
            println!("   #{} | {} | {:08x}", info.height, hash, info.bits);
        }
    }
    println!("✅ Generated {} block(s), height {}", hashes.len(), state.chain.best_snapshot().height);
    Ok(())
}

/// Run the CPU miner until interrupted or for a fixed number of seconds
pub async fn cmd_mine(
    state: &AppState,
    address: Option<&str>,
    algo: Option<&str>,
    workers: Option<i32>,
    seconds: Option<u64>,
) -> CliResult<()> {
    let miner = state.miner(address, algo, workers);
    let start_height = state.chain.best_snapshot().height;
    miner.start()?;
    println!(
        "⛏️  Mining {} with {} worker(s), press Ctrl-C to stop",
        miner.algo(),
        miner.num_workers()
    );

    match seconds {
        Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    let hashes_per_second = miner.hashes_per_second();
    miner.stop().await;

    let best = state.chain.best_snapshot();
    println!("🛑 Miner stopped");
    println!("   ├─ Blocks mined: {}", best.height - start_height);
    println!("   ├─ Height: {}", best.height);
    println!("   └─ Hash rate: {:.2} h/s", hashes_per_second);
    Ok(())
}
