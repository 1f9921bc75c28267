//! Difficulty retargeting
//!
//! The required target of the next block depends on the era of its height:
//!
//! - Era 0 averages the last `averaging_interval` blocks of the requested
//!   algorithm and moves the target proportionally, bounded per retarget.
//! - Era 1 ("Plan 9") blends four observed/target ratios, cubes each and
//!   averages the cubes into one adjustment factor.
//! - Later eras have no formula and require their floor.
//!
//! Every node must compute bit-identical results, so the floating point
//! operations below keep a fixed order and are not to be rearranged.

use crate::core::block_index::{BlockIndex, NodeId};
use crate::core::compact::{big_to_compact, compact_to_big};
use crate::core::fork::{ForkTable, SECOND_POW_LIMIT_BITS};
use crate::core::params::ChainParams;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive};

/// Weight of the most recent per-algorithm interval
const ALGO_DECAY: f64 = 0.75;

/// Weight of the most recent interval across all algorithms
const TRAILING_DECAY: f64 = 0.81;

/// Outcome of a retarget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retarget {
    /// Required compact target
    pub bits: u32,
    /// Plan 9 adjustment factor, when one was applied
    pub adjustment: Option<f64>,
}

impl Retarget {
    fn bits(bits: u32) -> Self {
        Self {
            bits,
            adjustment: None,
        }
    }
}

/// Retarget calculator over a borrowed block index
pub struct DifficultyEngine<'a> {
    params: &'a ChainParams,
    forks: &'a ForkTable,
    index: &'a BlockIndex,
}

impl<'a> DifficultyEngine<'a> {
    pub fn new(params: &'a ChainParams, forks: &'a ForkTable, index: &'a BlockIndex) -> Self {
        Self {
            params,
            forks,
            index,
        }
    }

    /// Required target for a block of algorithm `algo` on top of `last`.
    ///
    /// With no `last` node the floor of the first era applies.
    pub fn next_required(&self, last: Option<NodeId>, algo: &str) -> Retarget {
        let height = last.map(|id| self.index.node(id).height + 1).unwrap_or(0);

        match (self.forks.current_era(height), last) {
            (0, _) => Retarget::bits(self.legacy(last, algo, height)),
            (1, Some(last)) => self.plan9(last, algo, height),
            _ => Retarget::bits(self.forks.min_bits(algo, height)),
        }
    }

    // =========================================================================
    // Era 0
    // =========================================================================

    fn legacy(&self, last: Option<NodeId>, algo: &str, height: i32) -> u32 {
        let (version, name) = self.forks.normalize_algo(algo, height);
        let floor_bits = self.forks.min_bits(&name, height);

        let Some(last) = last else {
            return floor_bits;
        };

        let last_node = self.index.node(last);
        let mut last_version = last_node.version;
        if self.forks.current_era(last_node.height) == 0
            && self.forks.algo_name(last_version, last_node.height).is_none()
        {
            let era = self.forks.era(last_node.height);
            let default_version = era
                .algos
                .get(&era.default_algo)
                .map(|a| a.version)
                .unwrap_or_default();
            log::warn!(
                "Irregular block version {} at height {}, assuming {}",
                last_version,
                last_node.height,
                default_version
            );
            last_version = default_version;
        }

        let prev = if last_version != version {
            self.index.last_with_algo(last, version)
        } else {
            Some(last)
        };
        let Some(prev) = prev else {
            return floor_bits;
        };

        let mut first = prev;
        for _ in 1..self.forks.averaging_interval(height) {
            let next = self
                .index
                .parent(first)
                .and_then(|p| self.index.last_with_algo(p, version));
            match next {
                Some(n) => first = n,
                None => {
                    log::debug!("Retarget for {} at {} passed genesis", name, height);
                    return floor_bits;
                }
            }
        }

        let prev_node = self.index.node(prev);
        let actual_timespan = prev_node.timestamp - self.index.node(first).timestamp;
        let adjusted_timespan = actual_timespan.clamp(
            self.params.min_actual_timespan,
            self.params.max_actual_timespan,
        );

        let floor = compact_to_big(floor_bits);
        let mut new_target = compact_to_big(prev_node.bits) * BigInt::from(adjusted_timespan)
            / BigInt::from(self.params.averaging_target_timespan);
        if new_target > floor {
            new_target = floor;
        }

        let bits = big_to_compact(&new_target);
        log::debug!(
            "Difficulty retarget at height {}: old {:08x} new {:08x} (timespan {} adjusted {})",
            height,
            prev_node.bits,
            bits,
            actual_timespan,
            adjusted_timespan
        );
        bits
    }

    // =========================================================================
    // Era 1
    // =========================================================================

    fn plan9(&self, last_id: NodeId, algo: &str, height: i32) -> Retarget {
        let index = self.index;
        let last_node = index.node(last_id);
        let era = self.forks.era(height);

        if last_node.height == 0 {
            return Retarget::bits(era.pow_limit_bits);
        }

        let (version, name) = self.forks.normalize_algo(algo, height);
        let floor_bits = self.forks.min_bits(&name, height);

        // Most recent block of the same algorithm; genesis does not count
        // as its timestamp is not a mining time.
        let mut last = last_id;
        if last_node.version != version {
            match last_node
                .parent
                .and_then(|p| index.last_with_algo(p, version))
            {
                Some(l) if index.node(l).height >= 1 => last = l,
                _ => return Retarget::bits(floor_bits),
            }
        }

        let interval = self.forks.averaging_interval(height);

        // Timestamps of the same algorithm, newest first
        let mut timestamps = vec![index.node(last).timestamp as f64];
        let mut counter = 1;
        let mut pb = last;
        while counter < interval && index.node(pb).height > 2 {
            let Some(p) = index.parent(pb) else {
                break;
            };
            if index.node(p).height == 0 {
                return Retarget::bits(SECOND_POW_LIMIT_BITS);
            }
            match index.last_with_algo(p, version) {
                Some(found) if index.node(found).height > 0 => {
                    pb = found;
                    timestamps.push(index.node(pb).timestamp as f64);
                }
                _ => break,
            }
            counter += 1;
        }

        let ttpb = self.forks.target_time_per_block(height);
        let num_algos = era.num_algos() as i64;
        let mut all_time_average = ttpb as f64;
        let mut trail_time_average = ttpb as f64;

        // Testnet averages from height 1, mainnet from the era's activation
        let start_height = if self.forks.is_testnet() {
            1
        } else {
            self.forks
                .activation_height(era.number)
                .unwrap_or(1)
                .max(1)
        };
        let mut trail_height = last_node.height as i64 - interval * num_algos;
        if trail_height < 0 {
            trail_height = 1;
        }

        let last_time = last_node.timestamp as f64;
        if let Some(first) = index.ancestor(last_id, start_height) {
            let first = index.node(first);
            all_time_average = (last_time - first.timestamp as f64)
                / (last_node.height as f64 - first.height as f64);
        }
        if let Some(trail) = index.ancestor(last_id, trail_height as i32) {
            let trail = index.node(trail);
            trail_time_average = (last_time - trail.timestamp as f64)
                / (last_node.height as f64 - trail.height as f64);
        }

        if timestamps.len() < 2 {
            return Retarget::bits(SECOND_POW_LIMIT_BITS);
        }

        // Per-algorithm divergence
        let target = (ttpb * num_algos) as f64;
        let mut adjusted = 0.0;
        let mut target_adjusted = 0.0;
        for i in 0..timestamps.len() - 1 {
            let factor = if i == 0 { ALGO_DECAY } else { 1.0 };
            let adjustment = (timestamps[i] - timestamps[i + 1]) * factor;
            adjusted += adjustment;
            target_adjusted += target * factor;
        }

        // Divergence across all algorithms; steps two blocks per pass
        let mut trailing = vec![last_node.timestamp as f64];
        let mut counter = 1;
        let mut pb = last_id;
        while counter < interval && index.node(pb).height > 2 {
            let Some(p) = index.parent(pb) else {
                break;
            };
            pb = p;
            trailing.push(index.node(pb).timestamp as f64);
            counter += 2;
        }

        let mut trailing_adjusted = 0.0;
        let mut trailing_target_adjusted = 0.0;
        if trailing.len() > 1 {
            for i in 0..trailing.len() - 1 {
                let factor = if i == 0 { TRAILING_DECAY } else { 1.0 };
                let adjustment = (trailing[i] - trailing[i + 1]) * factor;
                trailing_adjusted += adjustment;
                trailing_target_adjusted += ttpb as f64 * factor;
            }
        } else {
            trailing_adjusted = 100.0;
            trailing_target_adjusted = 100.0;
        }

        let ttpb = ttpb as f64;
        let all_time_divergence = all_time_average / ttpb;
        let trail_time_divergence = trail_time_average / ttpb;
        let trailing_time_divergence = trailing_adjusted / trailing_target_adjusted;
        let weighted = adjusted / target_adjusted;

        let mut adjustment = (weighted * weighted * weighted
            + trailing_time_divergence * trailing_time_divergence * trailing_time_divergence
            + trail_time_divergence * trail_time_divergence * trail_time_divergence
            + all_time_divergence * all_time_divergence * all_time_divergence)
            / 4.0;

        if adjustment < 0.0 {
            log::warn!("Negative weight adjustment at height {}", height);
            adjustment = all_time_divergence;
        }
        if adjustment.is_nan() {
            return Retarget::bits(last_node.bits);
        }
        if adjustment < 0.0 {
            adjustment = (1.0 - adjustment) * adjustment;
        }

        let old_bits = index.node(last).bits;
        let new_target = compact_to_big(old_bits)
            .to_f64()
            .and_then(|old| BigInt::from_f64(old * adjustment));
        let Some(new_target) = new_target else {
            return Retarget::bits(floor_bits);
        };

        if new_target < compact_to_big(floor_bits) {
            let bits = big_to_compact(&new_target);
            log::info!(
                "{}: old {:08x}, new {:08x}, av {:.2}, tr {:.2}, tr wgtd {:.2}, alg wgtd {:.2}, blks {}, adj {:.1}%, alg {}",
                height,
                old_bits,
                bits,
                all_time_average,
                trail_time_average,
                trailing_time_divergence * ttpb,
                weighted * ttpb,
                timestamps.len() - 1,
                (1.0 - adjustment) * 100.0,
                name
            );
            return Retarget {
                bits,
                adjustment: Some(adjustment),
            };
        }

        Retarget::bits(floor_bits)
    }

    // =========================================================================
    // Checkpoint plausibility
    // =========================================================================

    /// Easiest target reachable from `bits` after `duration` seconds.
    ///
    /// Each retarget window may at most multiply the target by the
    /// adjustment factor, and the result never exceeds the floor of the
    /// era at `height`.
    pub fn easiest_difficulty(&self, bits: u32, duration: i64, height: i32) -> u32 {
        let floor = compact_to_big(self.forks.era(height).pow_limit_bits);
        let factor = BigInt::from(self.params.retarget_adjustment_factor);
        let max_retarget_timespan =
            self.params.averaging_target_timespan * self.params.retarget_adjustment_factor;

        let mut remaining = duration;
        let mut new_target = compact_to_big(bits);
        while remaining > 0 && new_target < floor {
            new_target *= &factor;
            remaining -= max_retarget_timespan;
        }

        if new_target > floor {
            new_target = floor;
        }
        big_to_compact(&new_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{BlockHeader, Hash256};
    use crate::core::block_index::BlockStatus;
    use crate::core::fork::{
        AlgoParams, HardForkEra, FIRST_POW_LIMIT_BITS, MAIN_POW_LIMIT_BITS,
    };
    use std::sync::Arc;

    const HARD_BITS: u32 = 0x1d00ffff;

    /// (version, timestamp, bits) for each block after genesis
    fn build(forks: ForkTable, blocks: &[(i32, i64, u32)]) -> (BlockIndex, Vec<NodeId>) {
        let mut index = BlockIndex::new(Arc::new(forks));
        let genesis = BlockHeader {
            version: 2,
            prev_block: Hash256::zero(),
            merkle_root: Hash256::zero(),
            timestamp: 1_000_000,
            bits: MAIN_POW_LIMIT_BITS,
            nonce: 0,
        };
        let mut prev = genesis.block_hash();
        let mut ids = vec![index.add(&genesis, None, BlockStatus::DATA_STORED)];
        for (version, timestamp, bits) in blocks {
            let header = BlockHeader {
                version: *version,
                prev_block: prev,
                merkle_root: Hash256::zero(),
                timestamp: *timestamp,
                bits: *bits,
                nonce: 0,
            };
            prev = header.block_hash();
            let id = index.add(&header, ids.last().copied(), BlockStatus::DATA_STORED);
            ids.push(id);
        }
        (index, ids)
    }

    fn spaced(count: usize, version: i32, spacing: i64, bits: u32) -> Vec<(i32, i64, u32)> {
        (1..=count)
            .map(|i| (version, 1_000_000 + i as i64 * spacing, bits))
            .collect()
    }

    // =========================================================================
    // Era 0
    // =========================================================================

    #[test]
    fn test_no_same_algo_history_returns_floor() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(ForkTable::mainnet(), &spaced(10, 2, 300, HARD_BITS));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        let retarget = engine.next_required(ids.last().copied(), "scrypt");
        assert_eq!(retarget.bits, MAIN_POW_LIMIT_BITS);
        assert_eq!(retarget.adjustment, None);
    }

    #[test]
    fn test_short_history_returns_floor() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(ForkTable::mainnet(), &spaced(5, 2, 300, HARD_BITS));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        assert_eq!(
            engine.next_required(ids.last().copied(), "sha256d").bits,
            MAIN_POW_LIMIT_BITS
        );
        assert_eq!(engine.next_required(None, "sha256d").bits, MAIN_POW_LIMIT_BITS);
    }

    #[test]
    fn test_legacy_proportional_adjustment() {
        let params = ChainParams::mainnet();
        // Ten sha256d blocks at 310s span nine intervals: 2790s.
        let (index, ids) = build(ForkTable::mainnet(), &spaced(10, 2, 310, HARD_BITS));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        let expected = big_to_compact(&(compact_to_big(HARD_BITS) * 2790 / 3000));
        assert_eq!(engine.next_required(ids.last().copied(), "sha256d").bits, expected);
    }

    #[test]
    fn test_legacy_swing_is_bounded() {
        let params = ChainParams::mainnet();
        let old = compact_to_big(HARD_BITS);

        let (index, ids) = build(ForkTable::mainnet(), &spaced(12, 2, 1, HARD_BITS));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);
        let fast = compact_to_big(engine.next_required(ids.last().copied(), "sha256d").bits);
        assert_eq!(fast, compact_to_big(big_to_compact(&(&old * 2400 / 3000))));

        let (index, ids) = build(ForkTable::mainnet(), &spaced(12, 2, 100_000, HARD_BITS));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);
        let slow = compact_to_big(engine.next_required(ids.last().copied(), "sha256d").bits);
        assert_eq!(slow, compact_to_big(big_to_compact(&(&old * 3300 / 3000))));

        assert!(fast < old && old < slow);
    }

    #[test]
    fn test_legacy_never_easier_than_floor() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(
            ForkTable::mainnet(),
            &spaced(12, 2, 100_000, MAIN_POW_LIMIT_BITS),
        );
        let engine = DifficultyEngine::new(&params, index.forks(), &index);
        assert_eq!(
            engine.next_required(ids.last().copied(), "sha256d").bits,
            MAIN_POW_LIMIT_BITS
        );
    }

    #[test]
    fn test_legacy_skips_other_algorithms() {
        let params = ChainParams::mainnet();
        let mut blocks = Vec::new();
        let mut t = 1_000_000;
        for i in 0..30 {
            t += 150;
            let version = if i % 2 == 0 { 2 } else { 514 };
            blocks.push((version, t, HARD_BITS));
        }
        let (index, ids) = build(ForkTable::mainnet(), &blocks);
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        // The tip is scrypt; sha256d blocks are 300s apart, nine intervals.
        let tip = *ids.last().unwrap();
        assert_eq!(index.node(tip).version, 514);
        let expected = big_to_compact(&(compact_to_big(HARD_BITS) * 2700 / 3000));
        assert_eq!(engine.next_required(Some(tip), "sha256d").bits, expected);
        assert_eq!(engine.next_required(Some(tip), "scrypt").bits, expected);
    }

    #[test]
    fn test_irregular_version_treated_as_default() {
        let params = ChainParams::mainnet();
        let mut blocks = spaced(10, 2, 300, HARD_BITS);
        blocks.push((7, 1_000_000 + 11 * 300, HARD_BITS));
        let (index, ids) = build(ForkTable::mainnet(), &blocks);
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        // The irregular tip stands in for a sha256d block: its parent chain
        // supplies the remaining nine sha256d ancestors.
        let tip = *ids.last().unwrap();
        let retarget = engine.next_required(Some(tip), "sha256d");
        assert_ne!(retarget.bits, MAIN_POW_LIMIT_BITS);
    }

    #[test]
    fn test_unknown_algorithm_uses_default() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(ForkTable::mainnet(), &spaced(10, 2, 310, HARD_BITS));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);
        let tip = ids.last().copied();
        assert_eq!(
            engine.next_required(tip, "no-such-algo"),
            engine.next_required(tip, "sha256d")
        );
    }

    // =========================================================================
    // Era 1
    // =========================================================================

    /// Era 0 until height 10, then a two-algorithm Plan 9 era with a
    /// four-block averaging window and 9s blocks, then a formula-less era.
    fn plan9_table() -> ForkTable {
        plan9_table_for(false)
    }

    fn plan9_table_for(testnet: bool) -> ForkTable {
        let legacy = HardForkEra::new(
            0,
            "legacy",
            0,
            0,
            10,
            300,
            MAIN_POW_LIMIT_BITS,
            &[("sha256d", AlgoParams::new(2, MAIN_POW_LIMIT_BITS, 0, 824))],
        );
        let plan9 = HardForkEra::new(
            1,
            "plan9",
            10,
            10,
            4,
            9,
            FIRST_POW_LIMIT_BITS,
            &[
                ("blake2b", AlgoParams::new(0, FIRST_POW_LIMIT_BITS, 0, 100)),
                ("blake2s", AlgoParams::new(1, FIRST_POW_LIMIT_BITS, 1, 100)),
            ],
        );
        let future = HardForkEra::new(
            2,
            "future",
            1000,
            1000,
            4,
            9,
            FIRST_POW_LIMIT_BITS,
            &[("x11", AlgoParams::new(8, 0x1f00ffff, 0, 100))],
        );
        ForkTable::new(vec![legacy, plan9, future], testnet).unwrap()
    }

    /// 40 blocks; Plan 9 blocks alternate algorithms at `spacing` seconds.
    fn plan9_chain(spacing: i64) -> Vec<(i32, i64, u32)> {
        let mut blocks = Vec::new();
        let mut t = 1_000_000;
        for h in 1..=40 {
            if h < 10 {
                t += 300;
                blocks.push((2, t, MAIN_POW_LIMIT_BITS));
            } else {
                t += spacing;
                blocks.push(((h % 2) as i32, t, HARD_BITS));
            }
        }
        blocks
    }

    #[test]
    fn test_plan9_fast_blocks_raise_difficulty() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(plan9_table(), &plan9_chain(3));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        let tip = *ids.last().unwrap();
        assert_eq!(index.node(tip).version, 0);
        let retarget = engine.next_required(Some(tip), "blake2b");

        // Every ratio is a third of target, so the blend is (1/3)^3.
        let adjustment = retarget.adjustment.unwrap();
        assert!((adjustment - 1.0 / 27.0).abs() < 1e-12);
        assert!(compact_to_big(retarget.bits) < compact_to_big(HARD_BITS));
    }

    #[test]
    fn test_plan9_slow_blocks_lower_difficulty() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(plan9_table(), &plan9_chain(27));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        let tip = ids.last().copied();
        let retarget = engine.next_required(tip, "blake2s");
        let adjustment = retarget.adjustment.unwrap();
        assert!((adjustment - 27.0).abs() < 1e-9);
        assert!(compact_to_big(retarget.bits) > compact_to_big(HARD_BITS));
        assert!(compact_to_big(retarget.bits) < compact_to_big(FIRST_POW_LIMIT_BITS));
    }

    #[test]
    fn test_plan9_result_is_deterministic() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(plan9_table(), &plan9_chain(7));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);
        let tip = ids.last().copied();
        assert_eq!(
            engine.next_required(tip, "blake2b"),
            engine.next_required(tip, "blake2b")
        );
    }

    #[test]
    fn test_plan9_without_algorithm_history_returns_floor() {
        let params = ChainParams::mainnet();
        // Only blake2b blocks in Plan 9; nothing to average for blake2s.
        let mut blocks = plan9_chain(9);
        for b in blocks.iter_mut().skip(9) {
            b.0 = 0;
        }
        let (index, ids) = build(plan9_table(), &blocks);
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        let retarget = engine.next_required(ids.last().copied(), "blake2s");
        assert_eq!(retarget.bits, FIRST_POW_LIMIT_BITS);
        assert_eq!(retarget.adjustment, None);
    }

    #[test]
    fn test_plan9_never_easier_than_floor() {
        let params = ChainParams::mainnet();
        let mut blocks = plan9_chain(27);
        for b in blocks.iter_mut().skip(9) {
            b.2 = FIRST_POW_LIMIT_BITS;
        }
        let (index, ids) = build(plan9_table(), &blocks);
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        let retarget = engine.next_required(ids.last().copied(), "blake2b");
        assert_eq!(retarget.bits, FIRST_POW_LIMIT_BITS);
        assert_eq!(retarget.adjustment, None);
    }

    #[test]
    fn test_era_without_formula_returns_floor() {
        let params = ChainParams::mainnet();
        let mut blocks = plan9_chain(9);
        let mut t = blocks.last().unwrap().1;
        for h in 41..1000 {
            t += 9;
            blocks.push(((h % 2) as i32, t, HARD_BITS));
        }
        let (index, ids) = build(plan9_table(), &blocks);
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        assert_eq!(index.node(*ids.last().unwrap()).height, 999);
        assert_eq!(
            engine.next_required(ids.last().copied(), "x11").bits,
            0x1f00ffff
        );
    }

    /// Plan 9 chain whose last four blocks each step `step` seconds back.
    fn plan9_reversed_chain(step: i64) -> Vec<(i32, i64, u32)> {
        let mut blocks = plan9_chain(9);
        let t36 = blocks[35].1;
        for h in 37..=40 {
            blocks[h - 1].1 = t36 - step * (h as i64 - 36);
        }
        blocks
    }

    #[test]
    fn test_plan9_tip_at_activation_keeps_bits() {
        let params = ChainParams::mainnet();
        // Every block carries the blake2b version, so the tip at the
        // activation height has enough same-algorithm history while its
        // all-time average divides zero by zero.
        let mut blocks: Vec<(i32, i64, u32)> = spaced(9, 0, 300, MAIN_POW_LIMIT_BITS);
        blocks.push((0, 1_000_000 + 9 * 300 + 9, HARD_BITS));
        let (index, ids) = build(plan9_table(), &blocks);
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        let tip = *ids.last().unwrap();
        assert_eq!(index.node(tip).height, 10);
        let retarget = engine.next_required(Some(tip), "blake2b");
        assert_eq!(retarget.bits, HARD_BITS);
        assert_eq!(retarget.adjustment, None);
    }

    #[test]
    fn test_plan9_negative_blend_falls_back_to_all_time() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(plan9_table(), &plan9_reversed_chain(30));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        // Heights 10 to 40 still moved forward by 114s overall.
        let retarget = engine.next_required(ids.last().copied(), "blake2b");
        let all_time = (114.0 / 30.0) / 9.0;
        let adjustment = retarget.adjustment.unwrap();
        assert!((adjustment - all_time).abs() < 1e-12);
        assert!(compact_to_big(retarget.bits) < compact_to_big(HARD_BITS));
    }

    #[test]
    fn test_plan9_negative_all_time_is_rebiased() {
        let params = ChainParams::mainnet();
        let (index, ids) = build(plan9_table(), &plan9_reversed_chain(100));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        // The tip is 166s older than the activation block.
        let retarget = engine.next_required(ids.last().copied(), "blake2b");
        let all_time = (-166.0 / 30.0) / 9.0;
        let adjustment = retarget.adjustment.unwrap();
        assert!((adjustment - (1.0 - all_time) * all_time).abs() < 1e-12);
        assert!(adjustment < 0.0);
    }

    #[test]
    fn test_plan9_testnet_averages_from_height_one() {
        let params = ChainParams::testnet();
        let (index, ids) = build(plan9_table_for(true), &plan9_chain(9));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);
        let tip = ids.last().copied();

        // On-target spacing since activation makes every other term 1; the
        // all-time average spans the slow legacy blocks from height 1.
        let all_time = (2679.0 / 39.0) / 9.0;
        let expected = (3.0 + all_time * all_time * all_time) / 4.0;
        let retarget = engine.next_required(tip, "blake2b");
        assert!((retarget.adjustment.unwrap() - expected).abs() < 1e-9);

        let (index, ids) = build(plan9_table(), &plan9_chain(9));
        let mainnet_params = ChainParams::mainnet();
        let engine = DifficultyEngine::new(&mainnet_params, index.forks(), &index);
        let mainnet = engine.next_required(ids.last().copied(), "blake2b");
        assert!((mainnet.adjustment.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(mainnet.bits, HARD_BITS);
    }

    #[test]
    fn test_plan9_testnet_negative_blend_uses_height_one() {
        let params = ChainParams::testnet();
        let (index, ids) = build(plan9_table_for(true), &plan9_reversed_chain(100));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        // Negative on mainnet, but positive when measured from height 1.
        let retarget = engine.next_required(ids.last().copied(), "blake2b");
        let all_time = (2243.0 / 39.0) / 9.0;
        assert!((retarget.adjustment.unwrap() - all_time).abs() < 1e-12);
    }

    // =========================================================================
    // Easiest difficulty
    // =========================================================================

    #[test]
    fn test_easiest_difficulty() {
        let params = ChainParams::mainnet();
        let index = BlockIndex::new(Arc::new(ForkTable::mainnet()));
        let engine = DifficultyEngine::new(&params, index.forks(), &index);

        assert_eq!(engine.easiest_difficulty(HARD_BITS, 0, 0), HARD_BITS);

        let one_window = engine.easiest_difficulty(HARD_BITS, 1, 0);
        assert_eq!(one_window, big_to_compact(&(compact_to_big(HARD_BITS) * 2)));

        assert_eq!(
            engine.easiest_difficulty(HARD_BITS, 10_000_000, 0),
            MAIN_POW_LIMIT_BITS
        );
    }
}
