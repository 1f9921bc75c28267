//! Checkpoint System
//!
//! Hard-coded `(height, hash)` pairs of known-good blocks:
//! - Reject blocks that contradict a checkpoint
//! - Reject forks branching below the latest checkpoint
//! - Bound how little work a block may claim after a checkpoint

use crate::core::block::BlockHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Checkpoint Entry
// =============================================================================

/// A checkpoint representing a known-good block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: BlockHash,
    /// Unix timestamp of the block, when known
    pub timestamp: Option<i64>,
}

impl Checkpoint {
    pub fn new(height: i32, hash: BlockHash) -> Self {
        Self {
            height,
            hash,
            timestamp: None,
        }
    }

    pub fn with_timestamp(height: i32, hash: BlockHash, timestamp: i64) -> Self {
        Self {
            height,
            hash,
            timestamp: Some(timestamp),
        }
    }
}

// =============================================================================
// Checkpoint Manager
// =============================================================================

/// Checkpoints ordered by height
#[derive(Debug, Default, Clone)]
pub struct CheckpointManager {
    checkpoints: BTreeMap<i32, Checkpoint>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_checkpoints(checkpoints: Vec<Checkpoint>) -> Self {
        let mut manager = Self::new();
        manager.add_checkpoints(checkpoints);
        manager
    }

    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.insert(checkpoint.height, checkpoint);
    }

    pub fn add_checkpoints(&mut self, checkpoints: Vec<Checkpoint>) {
        for cp in checkpoints {
            self.add_checkpoint(cp);
        }
    }

    /// Check a block against the checkpoint at its height
    pub fn verify_checkpoint(&self, height: i32, hash: &BlockHash) -> CheckpointResult {
        match self.get_checkpoint(height) {
            Some(cp) if cp.hash == *hash => CheckpointResult::Match,
            Some(cp) => CheckpointResult::Mismatch {
                expected: cp.hash,
                got: *hash,
            },
            None => CheckpointResult::NoCheckpoint,
        }
    }

    pub fn get_checkpoint(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.get(&height)
    }

    /// The highest checkpoint
    pub fn get_highest(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next_back()
    }

    /// Highest checkpoint height, -1 without checkpoints
    pub fn highest_height(&self) -> i32 {
        self.get_highest().map(|cp| cp.height).unwrap_or(-1)
    }

    /// The highest checkpoint at or below `height`
    pub fn latest_before(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.range(..=height).next_back().map(|(_, cp)| cp)
    }

    /// All checkpoints by ascending height
    pub fn all(&self) -> Vec<&Checkpoint> {
        self.checkpoints.values().collect()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

// =============================================================================
// Checkpoint Result
// =============================================================================

/// Result of checkpoint verification
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointResult {
    /// Block matches the checkpoint
    Match,
    /// Block doesn't match the checkpoint
    Mismatch { expected: BlockHash, got: BlockHash },
    /// No checkpoint at this height
    NoCheckpoint,
}

impl CheckpointResult {
    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            CheckpointResult::Match | CheckpointResult::NoCheckpoint
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
