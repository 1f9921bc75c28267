//! Block validation rules
//!
//! Context-free sanity checks run before a block's parent is known.
//! Contextual checks need the block index and run through the
//! [`ContextValidator`] trait so the chain can be driven by an alternative
//! rule set in tests.

use crate::core::block::{Block, BlockHeader};
use crate::core::block_index::{BlockIndex, NodeId};
use crate::core::compact::{compact_to_big, hash_to_big};
use crate::core::difficulty::DifficultyEngine;
use crate::core::fork::ForkTable;
use crate::core::params::ChainParams;
use crate::storage::checkpoint::{CheckpointManager, CheckpointResult};
use bitflags::bitflags;
use num_bigint::{BigInt, Sign};
use thiserror::Error;

// =============================================================================
// Behaviour Flags
// =============================================================================

bitflags! {
    /// Modifiers for block processing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BehaviorFlags: u32 {
        /// Skip checks already known to pass, such as blocks below a checkpoint
        const FAST_ADD = 1 << 0;
        /// Do not check the proof-of-work hash against the target
        const NO_POW_CHECK = 1 << 1;
    }
}

// =============================================================================
// Rule Errors
// =============================================================================

/// Stable identifier of a consensus rule violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateBlock,
    PreviousBlockUnknown,
    InvalidAncestorBlock,
    UnknownAlgorithm,
    UnexpectedDifficulty,
    HighHash,
    BadMerkleRoot,
    TimeTooOld,
    TimeTooNew,
    BadCheckpoint,
    ForkTooOld,
    CheckpointTimeTooOld,
    DifficultyTooLow,
}

/// A consensus rule violation; the block is rejected permanently
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{description}")]
pub struct RuleError {
    pub kind: ErrorKind,
    pub description: String,
}

impl RuleError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

// =============================================================================
// Context-free checks
// =============================================================================

/// Checks that need nothing but the block itself.
///
/// `height` selects the era used to resolve the algorithm; `now` is the
/// local clock in Unix seconds.
pub fn check_block_sanity(
    block: &Block,
    height: i32,
    forks: &ForkTable,
    params: &ChainParams,
    flags: BehaviorFlags,
    now: i64,
) -> Result<(), RuleError> {
    let header = &block.header;
    let algo = forks.algo_name(header.version, height).ok_or_else(|| {
        RuleError::new(
            ErrorKind::UnknownAlgorithm,
            format!(
                "block version {} selects no algorithm at height {}",
                header.version, height
            ),
        )
    })?;

    check_proof_of_work(header, algo, height, forks, flags)?;

    if !block.verify_merkle_root() {
        return Err(RuleError::new(
            ErrorKind::BadMerkleRoot,
            format!("block merkle root is invalid: header has {}", header.merkle_root),
        ));
    }

    if header.timestamp > now + params.max_future_block_time {
        return Err(RuleError::new(
            ErrorKind::TimeTooNew,
            format!(
                "block timestamp {} is too far in the future (now {})",
                header.timestamp, now
            ),
        ));
    }

    Ok(())
}

/// Target range check, then the hash check unless `NO_POW_CHECK`
pub fn check_proof_of_work(
    header: &BlockHeader,
    algo: &str,
    height: i32,
    forks: &ForkTable,
    flags: BehaviorFlags,
) -> Result<(), RuleError> {
    let target = compact_to_big(header.bits);
    if target.sign() != Sign::Plus {
        return Err(RuleError::new(
            ErrorKind::UnexpectedDifficulty,
            format!("block target difficulty of {:08x} is not positive", header.bits),
        ));
    }

    let limit = forks.pow_limit(algo, height);
    if target > limit {
        return Err(RuleError::new(
            ErrorKind::UnexpectedDifficulty,
            format!(
                "block target difficulty of {:08x} is easier than the {} limit {:08x}",
                header.bits,
                algo,
                forks.min_bits(algo, height)
            ),
        ));
    }

    if !flags.contains(BehaviorFlags::NO_POW_CHECK) {
        let hash = header.pow_hash(algo);
        if BigInt::from(hash_to_big(&hash)) > target {
            return Err(RuleError::new(
                ErrorKind::HighHash,
                format!("{} hash {} is higher than the target", algo, hash),
            ));
        }
    }

    Ok(())
}

// =============================================================================
// Contextual checks
// =============================================================================

/// Read-only view of chain state handed to context validation
pub struct ChainContext<'a> {
    pub params: &'a ChainParams,
    pub forks: &'a ForkTable,
    pub index: &'a BlockIndex,
    pub checkpoints: &'a CheckpointManager,
}

/// Validation that depends on the block's position in the chain
pub trait ContextValidator: Send + Sync {
    fn check_block_context(
        &self,
        ctx: &ChainContext<'_>,
        block: &Block,
        parent: NodeId,
        flags: BehaviorFlags,
    ) -> Result<(), RuleError>;
}

/// The network's consensus rules
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsensusValidator;

impl ConsensusValidator {
    fn check_difficulty(
        &self,
        ctx: &ChainContext<'_>,
        header: &BlockHeader,
        parent: NodeId,
        height: i32,
    ) -> Result<(), RuleError> {
        let algo = ctx.forks.algo_name(header.version, height).ok_or_else(|| {
            RuleError::new(
                ErrorKind::UnknownAlgorithm,
                format!("block version {} selects no algorithm", header.version),
            )
        })?;

        let engine = DifficultyEngine::new(ctx.params, ctx.forks, ctx.index);
        let expected = engine.next_required(Some(parent), algo).bits;
        if header.bits != expected {
            return Err(RuleError::new(
                ErrorKind::UnexpectedDifficulty,
                format!(
                    "block difficulty of {:08x} is not the expected value of {:08x}",
                    header.bits, expected
                ),
            ));
        }
        Ok(())
    }
}

impl ContextValidator for ConsensusValidator {
    fn check_block_context(
        &self,
        ctx: &ChainContext<'_>,
        block: &Block,
        parent: NodeId,
        flags: BehaviorFlags,
    ) -> Result<(), RuleError> {
        let header = &block.header;
        let height = ctx.index.node(parent).height + 1;

        if !flags.contains(BehaviorFlags::FAST_ADD) {
            self.check_difficulty(ctx, header, parent, height)?;

            let median = ctx
                .index
                .median_time_past(parent, ctx.params.median_time_blocks);
            if header.timestamp <= median {
                return Err(RuleError::new(
                    ErrorKind::TimeTooOld,
                    format!(
                        "block timestamp of {} is not after expected {}",
                        header.timestamp, median
                    ),
                ));
            }
        }

        let hash = block.hash();
        if let CheckpointResult::Mismatch { expected, got } =
            ctx.checkpoints.verify_checkpoint(height, &hash)
        {
            return Err(RuleError::new(
                ErrorKind::BadCheckpoint,
                format!(
                    "block at height {} does not match checkpoint: expected {}, got {}",
                    height, expected, got
                ),
            ));
        }

        // Forks may not branch below the latest checkpoint we hold.
        let latest = ctx
            .checkpoints
            .all()
            .into_iter()
            .rev()
            .find(|cp| ctx.index.contains(&cp.hash));
        if let Some(checkpoint) = latest {
            if height < checkpoint.height {
                return Err(RuleError::new(
                    ErrorKind::ForkTooOld,
                    format!(
                        "block at height {} forks the main chain before the checkpoint at height {}",
                        height, checkpoint.height
                    ),
                ));
            }
        }

        Ok(())
    }
}
