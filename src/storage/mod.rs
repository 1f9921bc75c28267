//! Storage module for block and index persistence

pub mod checkpoint;
pub mod index;
pub mod persistence;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointResult};
pub use index::{IndexRecord, INDEX_RECORD_SIZE};
pub use persistence::{BlockStore, FileStore, MemoryStore, StorageConfig, StorageError};
