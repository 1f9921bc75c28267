//! Multialgo-Chain CLI Application
//!
//! A command-line interface for inspecting and mining the chain.

use clap::{Parser, Subcommand};
use multialgo_chain::cli::{self, AppState};
use multialgo_chain::config::NodeConfig;
use multialgo_chain::core::{ForkTable, Network};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "multialgo-chain")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A multi-algorithm proof-of-work consensus core", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for chain storage
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network to follow (mainnet, testnet, regtest)
    #[arg(short, long)]
    network: Option<Network>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the best chain state and next difficulties
    Info,

    /// List the hard-fork eras
    Eras,

    /// Decode a compact difficulty target
    Bits {
        /// Compact bits in hex, e.g. 1d00ffff
        bits: String,

        /// Height used for work weighting
        #[arg(long, default_value = "0")]
        height: i32,

        /// Algorithm used for work weighting
        #[arg(short, long, default_value = "sha256d")]
        algo: String,
    },

    /// Mine a fixed number of blocks
    Generate {
        /// Number of blocks to mine
        #[arg(short, long, default_value = "1")]
        count: u32,

        /// Payout address
        #[arg(short, long)]
        address: Option<String>,

        /// Algorithm name, or "random"
        #[arg(long)]
        algo: Option<String>,
    },

    /// Run the CPU miner
    Mine {
        /// Payout address
        #[arg(short, long)]
        address: Option<String>,

        /// Algorithm name, or "random"
        #[arg(long)]
        algo: Option<String>,

        /// Worker count; negative uses one per CPU
        #[arg(short, long, allow_hyphen_values = true)]
        workers: Option<i32>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    // Commands that don't need the chain
    match &cli.command {
        Commands::Eras => {
            return cli::cmd_eras(&ForkTable::for_network(config.network));
        }
        Commands::Bits { bits, height, algo } => {
            return cli::cmd_bits(&ForkTable::for_network(config.network), bits, *height, algo);
        }
        _ => {}
    }

    let state = AppState::new(config)?;

    match cli.command {
        Commands::Eras | Commands::Bits { .. } => unreachable!(),

        Commands::Info => {
            cli::cmd_info(&state)?;
        }

        Commands::Generate {
            count,
            address,
            algo,
        } => {
            cli::cmd_generate(&state, count, address.as_deref(), algo.as_deref()).await?;
        }

        Commands::Mine {
            address,
            algo,
            workers,
            seconds,
        } => {
            cli::cmd_mine(
                &state,
                address.as_deref(),
                algo.as_deref(),
                workers,
                seconds,
            )
            .await?;
        }
    }

    Ok(())
}
