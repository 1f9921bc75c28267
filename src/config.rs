//! Node configuration
//!
//! Read from an optional JSON file; every field has a default so a partial
//! file (or none at all) is valid.

use crate::core::params::Network;
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// CPU miner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Payout addresses, one is picked at random per template
    pub addresses: Vec<String>,
    /// Algorithm name, or "random"
    pub algo: String,
    /// Worker count; negative uses one per CPU
    pub workers: i32,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            algo: "sha256d".to_string(),
            workers: 1,
        }
    }
}

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    pub mining: MiningConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            data_dir: PathBuf::from(".multialgo_data"),
            mining: MiningConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        log::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Per-network data directory, so networks never share an index
    pub fn network_data_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.to_string())
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.network_data_dir(),
            ..Default::default()
        }
    }
}
