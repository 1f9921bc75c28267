//! Block persistence layer
//!
//! The chain writes every accepted block body and the changed block index
//! records through the [`BlockStore`] trait. Success means the data is
//! durable; errors propagate to the caller and are never retried here.

use crate::core::block::{Block, BlockHash};
use crate::storage::index::IndexRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Corrupt block index: {0}")]
    CorruptIndex(String),
    #[error("Missing data: {0}")]
    MissingData(String),
}

/// Durable storage for block bodies and index metadata
pub trait BlockStore: Send + Sync {
    /// Persist a full block, keyed by its hash
    fn store_block(&self, block: &Block) -> Result<(), StorageError>;

    fn fetch_block(&self, hash: &BlockHash) -> Result<Option<Block>, StorageError>;

    /// Persist changed index records
    fn flush_index_metadata(&self, records: &[IndexRecord]) -> Result<(), StorageError>;

    /// Every index record written so far, oldest first
    fn load_index(&self) -> Result<Vec<IndexRecord>, StorageError>;
}

// =============================================================================
// File Store
// =============================================================================

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub blocks_dir: String,
    pub index_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".multialgo_data"),
            blocks_dir: "blocks".to_string(),
            index_file: "index.dat".to_string(),
        }
    }
}

/// Blocks as JSON documents plus an append-only index log
pub struct FileStore {
    config: StorageConfig,
    // Serialises appends to the index log.
    index_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(config.data_dir.join(&config.blocks_dir))?;
        Ok(Self {
            config,
            index_lock: Mutex::new(()),
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, StorageError> {
        Self::new(StorageConfig::default())
    }

    fn block_path(&self, hash: &BlockHash) -> PathBuf {
        self.config
            .data_dir
            .join(&self.config.blocks_dir)
            .join(format!("{}.json", hash))
    }

    fn index_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.index_file)
    }
}

impl BlockStore for FileStore {
    fn store_block(&self, block: &Block) -> Result<(), StorageError> {
        let path = self.block_path(&block.hash());
        if path.exists() {
            return Ok(());
        }

        // Write to temporary file first
        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, block)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn fetch_block(&self, hash: &BlockHash) -> Result<Option<Block>, StorageError> {
        let path = self.block_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    fn flush_index_metadata(&self, records: &[IndexRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let _guard = self.index_lock.lock();
        let mut buf = Vec::with_capacity(records.len() * crate::storage::index::INDEX_RECORD_SIZE);
        for record in records {
            buf.extend_from_slice(&record.encode());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn load_index(&self) -> Result<Vec<IndexRecord>, StorageError> {
        let _guard = self.index_lock.lock();
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(&path)?;
        let records = IndexRecord::decode_all(&data)?;

        // Cut a torn tail so the next append starts on a record boundary
        let complete = records.len() * crate::storage::index::INDEX_RECORD_SIZE;
        if complete != data.len() {
            OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_len(complete as u64)?;
        }
        Ok(records)
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// Volatile store for tests and throwaway chains
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<BlockHash, Block>>,
    index: Mutex<Vec<IndexRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockStore for MemoryStore {
    fn store_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.lock().insert(block.hash(), block.clone());
        Ok(())
    }

    fn fetch_block(&self, hash: &BlockHash) -> Result<Option<Block>, StorageError> {
        Ok(self.blocks.lock().get(hash).cloned())
    }

    fn flush_index_metadata(&self, records: &[IndexRecord]) -> Result<(), StorageError> {
        self.index.lock().extend_from_slice(records);
        Ok(())
    }

    fn load_index(&self) -> Result<Vec<IndexRecord>, StorageError> {
        Ok(self.index.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{BlockHeader, Coinbase, Hash256};

    fn block(nonce: u32) -> Block {
        let header = BlockHeader {
            version: 2,
            prev_block: Hash256::zero(),
            merkle_root: Hash256::zero(),
            timestamp: 1_700_000_000,
            bits: 0x207fffff,
            nonce,
        };
        let mut block = Block::new(header, Coinbase::new("addr", 1, 0), vec![]);
        block.update_merkle_root();
        block
    }

    fn record(block: &Block) -> IndexRecord {
        IndexRecord {
            height: 1,
            hash: block.hash(),
            parent: block.header.prev_block,
            bits: block.header.bits,
            version: block.header.version,
            timestamp: block.header.timestamp,
            status: 1,
        }
    }

    #[test]
    fn test_file_store_blocks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = FileStore::new(config).unwrap();

        let b = block(1);
        store.store_block(&b).unwrap();
        // Storing again is a no-op.
        store.store_block(&b).unwrap();

        assert_eq!(store.fetch_block(&b.hash()).unwrap(), Some(b));
        assert_eq!(store.fetch_block(&block(2).hash()).unwrap(), None);
    }

    #[test]
    fn test_file_store_index_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        let (a, b) = (block(1), block(2));
        {
            let store = FileStore::new(config.clone()).unwrap();
            assert!(store.load_index().unwrap().is_empty());
            store.flush_index_metadata(&[record(&a)]).unwrap();
            store.flush_index_metadata(&[record(&b), record(&a)]).unwrap();
        }

        let store = FileStore::new(config).unwrap();
        let records = store.load_index().unwrap();
        assert_eq!(records, vec![record(&a), record(&b), record(&a)]);
    }

    #[test]
    fn test_file_store_recovers_torn_index_append() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        let (a, b, c) = (block(1), block(2), block(3));
        {
            let store = FileStore::new(config.clone()).unwrap();
            store.flush_index_metadata(&[record(&a), record(&b)]).unwrap();
            // Simulate a crash part way through the next append.
            let mut file = OpenOptions::new()
                .append(true)
                .open(store.index_path())
                .unwrap();
            file.write_all(&record(&c).encode()[..30]).unwrap();
        }

        let store = FileStore::new(config.clone()).unwrap();
        assert_eq!(store.load_index().unwrap(), vec![record(&a), record(&b)]);

        store.flush_index_metadata(&[record(&c)]).unwrap();
        let store = FileStore::new(config).unwrap();
        assert_eq!(
            store.load_index().unwrap(),
            vec![record(&a), record(&b), record(&c)]
        );
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let b = block(3);
        store.store_block(&b).unwrap();
        store.flush_index_metadata(&[record(&b)]).unwrap();

        assert_eq!(store.block_count(), 1);
        assert_eq!(store.fetch_block(&b.hash()).unwrap(), Some(b));
        assert_eq!(store.load_index().unwrap().len(), 1);
    }
}
