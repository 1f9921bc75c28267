//! Hard fork era table
//!
//! Consensus rules change at fixed heights. Each era carries its own set of
//! proof-of-work algorithms, averaging window and block time. The table is
//! an immutable value built once per network and handed to the chain and
//! miner by reference, so tests can inject synthetic tables.

use crate::core::compact::compact_to_big;
use crate::core::params::Network;
use num_bigint::BigInt;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

// =============================================================================
// Proof-of-work floors
// =============================================================================

/// Easiest target of the first era on mainnet
pub const MAIN_POW_LIMIT_BITS: u32 = 0x1e0f_ffff;

/// Easiest target of the Plan 9 era
pub const FIRST_POW_LIMIT_BITS: u32 = 0x200f_ffff;

/// Returned by Plan 9 when the per-algorithm history reaches genesis
pub const SECOND_POW_LIMIT_BITS: u32 = 0x2007_ffff;

/// Regression test networks mine at this target in every era
pub const REGTEST_POW_LIMIT_BITS: u32 = 0x207f_ffff;

/// Height at which Plan 9 activates on mainnet
pub const PLAN9_ACTIVATION_HEIGHT: i32 = 250_000;

/// Height at which Plan 9 activates on testnet
pub const PLAN9_TESTNET_ACTIVATION_HEIGHT: i32 = 100;

/// Special algorithm name asking for a random pick from the era
pub const RANDOM_ALGO: &str = "random";

// =============================================================================
// Errors
// =============================================================================

/// Malformed era tables
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForkTableError {
    #[error("Fork table has no eras")]
    Empty,
    #[error("First era must activate at height 0, found {0}")]
    FirstEraNotGenesis(i32),
    #[error("Era {0} activates before the era preceding it")]
    UnorderedActivation(usize),
    #[error("Era {0} registers no algorithms")]
    NoAlgorithms(usize),
    #[error("Era {0} registers version {1} twice")]
    DuplicateVersion(usize, i32),
    #[error("Era {0} has default algorithm {1} which it does not register")]
    UnknownDefault(usize, String),
}

// =============================================================================
// Era definitions
// =============================================================================

/// Parameters of one proof-of-work algorithm within an era
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlgoParams {
    /// Header version selecting this algorithm
    pub version: i32,
    /// Easiest compact target the algorithm may use
    pub min_bits: u32,
    /// Stable numeric id
    pub algo_id: u32,
    /// Measured cost of one hash, used to weight work between algorithms
    pub ns_per_op: i64,
}

impl AlgoParams {
    pub const fn new(version: i32, min_bits: u32, algo_id: u32, ns_per_op: i64) -> Self {
        Self {
            version,
            min_bits,
            algo_id,
            ns_per_op,
        }
    }
}

/// One consensus era
#[derive(Debug, Clone, Serialize)]
pub struct HardForkEra {
    /// Sequence number in the table
    pub number: usize,
    pub name: String,
    /// Activation height on mainnet
    pub activation_height: i32,
    /// Activation height when the table runs in testnet mode
    pub testnet_height: i32,
    /// Algorithms by name
    pub algos: BTreeMap<String, AlgoParams>,
    /// Reverse map of `algos` by header version
    pub algo_vers: BTreeMap<i32, String>,
    /// Mean ns-per-op of the era's algorithms
    pub work_base: i64,
    /// Number of blocks averaged by the retarget
    pub averaging_interval: i64,
    /// Target seconds per block
    pub target_time_per_block: i64,
    /// Algorithm used when a request names none the era knows
    pub default_algo: String,
    /// Floor of the era, also returned for eras without a retarget formula
    pub pow_limit_bits: u32,
}

impl HardForkEra {
    /// Build an era; the first algorithm listed becomes the default.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: usize,
        name: &str,
        activation_height: i32,
        testnet_height: i32,
        averaging_interval: i64,
        target_time_per_block: i64,
        pow_limit_bits: u32,
        algos: &[(&str, AlgoParams)],
    ) -> Self {
        let default_algo = algos
            .first()
            .map(|(name, _)| name.to_string())
            .unwrap_or_default();

        let algo_vers = algos
            .iter()
            .map(|(name, params)| (params.version, name.to_string()))
            .collect();

        let work_base = if algos.is_empty() {
            0
        } else {
            algos.iter().map(|(_, p)| p.ns_per_op).sum::<i64>() / algos.len() as i64
        };

        Self {
            number,
            name: name.to_string(),
            activation_height,
            testnet_height,
            algos: algos
                .iter()
                .map(|(name, params)| (name.to_string(), *params))
                .collect(),
            algo_vers,
            work_base,
            averaging_interval,
            target_time_per_block,
            default_algo,
            pow_limit_bits,
        }
    }

    /// Number of algorithms in the era
    pub fn num_algos(&self) -> usize {
        self.algos.len()
    }
}

// =============================================================================
// Fork Table
// =============================================================================

/// Ordered, immutable list of eras for one network
#[derive(Debug, Clone)]
pub struct ForkTable {
    eras: Vec<HardForkEra>,
    testnet: bool,
}

impl ForkTable {
    /// Create a table from explicit eras
    pub fn new(eras: Vec<HardForkEra>, testnet: bool) -> Result<Self, ForkTableError> {
        let first = eras.first().ok_or(ForkTableError::Empty)?;
        let first_height = if testnet {
            first.testnet_height
        } else {
            first.activation_height
        };
        if first_height != 0 {
            return Err(ForkTableError::FirstEraNotGenesis(first_height));
        }

        for (i, era) in eras.iter().enumerate() {
            if era.algos.is_empty() {
                return Err(ForkTableError::NoAlgorithms(i));
            }
            if era.algo_vers.len() != era.algos.len() {
                let mut seen = std::collections::BTreeSet::new();
                for params in era.algos.values() {
                    if !seen.insert(params.version) {
                        return Err(ForkTableError::DuplicateVersion(i, params.version));
                    }
                }
            }
            if !era.algos.contains_key(&era.default_algo) {
                return Err(ForkTableError::UnknownDefault(i, era.default_algo.clone()));
            }
            if i > 0 {
                let prev = &eras[i - 1];
                let ordered = if testnet {
                    era.testnet_height > prev.testnet_height
                } else {
                    era.activation_height > prev.activation_height
                };
                if !ordered {
                    return Err(ForkTableError::UnorderedActivation(i));
                }
            }
        }

        Ok(Self { eras, testnet })
    }

    /// The mainnet table
    pub fn mainnet() -> Self {
        Self::new(Self::standard_eras(MAIN_POW_LIMIT_BITS, FIRST_POW_LIMIT_BITS), false)
            .expect("built-in mainnet era table is valid")
    }

    /// The testnet table, identical to mainnet but activating Plan 9 early
    pub fn testnet() -> Self {
        Self::new(Self::standard_eras(MAIN_POW_LIMIT_BITS, FIRST_POW_LIMIT_BITS), true)
            .expect("built-in testnet era table is valid")
    }

    /// The regression test table: testnet heights with trivially easy floors
    pub fn regtest() -> Self {
        Self::new(
            Self::standard_eras(REGTEST_POW_LIMIT_BITS, REGTEST_POW_LIMIT_BITS),
            true,
        )
        .expect("built-in regtest era table is valid")
    }

    /// Table for a network
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    fn standard_eras(halcyon_floor: u32, plan9_floor: u32) -> Vec<HardForkEra> {
        let halcyon = HardForkEra::new(
            0,
            "Halcyon days",
            0,
            0,
            10,
            300,
            halcyon_floor,
            &[
                ("sha256d", AlgoParams::new(2, halcyon_floor, 0, 824)),
                ("scrypt", AlgoParams::new(514, halcyon_floor, 1, 740_839)),
            ],
        );

        let plan9 = HardForkEra::new(
            1,
            "Plan 9 from Crypto Space",
            PLAN9_ACTIVATION_HEIGHT,
            PLAN9_TESTNET_ACTIVATION_HEIGHT,
            9600,
            9,
            plan9_floor,
            &[
                ("sha256d", AlgoParams::new(5, plan9_floor, 5, 67_460_443)),
                ("blake2b", AlgoParams::new(0, plan9_floor, 0, 69_495_444)),
                ("blake14lr", AlgoParams::new(1, plan9_floor, 1, 79_734_306)),
                ("blake2s", AlgoParams::new(2, plan9_floor, 2, 69_968_425)),
                ("keccak", AlgoParams::new(3, plan9_floor, 3, 71_988_313)),
                ("scrypt", AlgoParams::new(4, plan9_floor, 4, 68_395_274)),
                ("skein", AlgoParams::new(6, plan9_floor, 7, 64_433_603)),
                ("stribog", AlgoParams::new(7, plan9_floor, 6, 69_987_634)),
                ("x11", AlgoParams::new(8, plan9_floor, 8, 64_936_544)),
            ],
        );

        vec![halcyon, plan9]
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Whether testnet activation heights are in use
    pub fn is_testnet(&self) -> bool {
        self.testnet
    }

    /// All eras in activation order
    pub fn eras(&self) -> &[HardForkEra] {
        &self.eras
    }

    /// Activation height of an era on this table's network
    pub fn activation_height(&self, era: usize) -> Option<i32> {
        self.eras.get(era).map(|e| {
            if self.testnet {
                e.testnet_height
            } else {
                e.activation_height
            }
        })
    }

    /// Index of the last era whose activation height is at or below `height`
    pub fn current_era(&self, height: i32) -> usize {
        let mut current = 0;
        for i in 0..self.eras.len() {
            match self.activation_height(i) {
                Some(activation) if activation <= height => current = i,
                _ => break,
            }
        }
        current
    }

    /// The era in force at `height`
    pub fn era(&self, height: i32) -> &HardForkEra {
        &self.eras[self.current_era(height)]
    }

    /// Header version for an algorithm name
    ///
    /// `"random"` draws uniformly from the era's algorithms using the
    /// operating system's RNG.
    pub fn algo_version(&self, name: &str, height: i32) -> Option<i32> {
        let era = self.era(height);
        if name == RANDOM_ALGO {
            let versions: Vec<i32> = era.algo_vers.keys().copied().collect();
            return versions.choose(&mut OsRng).copied();
        }
        era.algos.get(name).map(|a| a.version)
    }

    /// Algorithm name for a header version
    pub fn algo_name(&self, version: i32, height: i32) -> Option<&str> {
        self.era(height).algo_vers.get(&version).map(String::as_str)
    }

    /// Stable id of an algorithm
    pub fn algo_id(&self, name: &str, height: i32) -> Option<u32> {
        self.era(height).algos.get(name).map(|a| a.algo_id)
    }

    /// Easiest compact target for an algorithm; unknown names get the era floor
    pub fn min_bits(&self, name: &str, height: i32) -> u32 {
        let era = self.era(height);
        era.algos
            .get(name)
            .map(|a| a.min_bits)
            .unwrap_or(era.pow_limit_bits)
    }

    /// Easiest target for an algorithm as a number
    pub fn pow_limit(&self, name: &str, height: i32) -> BigInt {
        compact_to_big(self.min_bits(name, height))
    }

    pub fn averaging_interval(&self, height: i32) -> i64 {
        self.era(height).averaging_interval
    }

    pub fn target_time_per_block(&self, height: i32) -> i64 {
        self.era(height).target_time_per_block
    }

    /// Resolve a requested algorithm to `(version, name)`.
    ///
    /// Unknown names fall back to the era's default algorithm.
    pub fn normalize_algo(&self, name: &str, height: i32) -> (i32, String) {
        let era = self.era(height);
        if let Some(params) = era.algos.get(name) {
            return (params.version, name.to_string());
        }
        if name == RANDOM_ALGO {
            if let Some(version) = self.algo_version(name, height) {
                if let Some(resolved) = era.algo_vers.get(&version) {
                    return (version, resolved.clone());
                }
            }
        }

        log::warn!(
            "Unknown algorithm '{}' at height {}, using {}",
            name,
            height,
            era.default_algo
        );
        let version = era
            .algos
            .get(&era.default_algo)
            .map(|a| a.version)
            .unwrap_or_default();
        (version, era.default_algo.clone())
    }
}

impl Default for ForkTable {
    fn default() -> Self {
        Self::mainnet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(heights: &[i32]) -> ForkTable {
        let eras = heights
            .iter()
            .enumerate()
            .map(|(i, h)| {
                HardForkEra::new(
                    i,
                    &format!("era {}", i),
                    *h,
                    *h,
                    10,
                    60,
                    REGTEST_POW_LIMIT_BITS,
                    &[("sha256d", AlgoParams::new(2, REGTEST_POW_LIMIT_BITS, 0, 100))],
                )
            })
            .collect();
        ForkTable::new(eras, false).unwrap()
    }

    #[test]
    fn test_current_era_boundaries() {
        let table = synthetic(&[0, 100, 1000]);
        assert_eq!(table.current_era(50), 0);
        assert_eq!(table.current_era(99), 0);
        assert_eq!(table.current_era(100), 1);
        assert_eq!(table.current_era(150), 1);
        assert_eq!(table.current_era(1500), 2);
        assert_eq!(table.current_era(-1), 0);
    }

    #[test]
    fn test_era_monotonic() {
        let table = synthetic(&[0, 7, 40, 41, 300]);
        let mut last = 0;
        for h in 0..400 {
            let era = table.current_era(h);
            assert!(era >= last);
            last = era;
        }
        assert_eq!(last, 4);
    }

    #[test]
    fn test_testnet_flag_moves_activation() {
        let main = ForkTable::mainnet();
        let test = ForkTable::testnet();
        assert_eq!(main.current_era(150), 0);
        assert_eq!(test.current_era(150), 1);
        assert_eq!(main.current_era(PLAN9_ACTIVATION_HEIGHT), 1);
        assert_eq!(test.activation_height(1), Some(PLAN9_TESTNET_ACTIVATION_HEIGHT));
        assert_eq!(main.activation_height(7), None);
    }

    #[test]
    fn test_mainnet_lookups() {
        let table = ForkTable::mainnet();
        assert_eq!(table.algo_version("sha256d", 0), Some(2));
        assert_eq!(table.algo_version("scrypt", 0), Some(514));
        assert_eq!(table.algo_version("x11", 0), None);
        assert_eq!(table.algo_name(514, 10), Some("scrypt"));
        assert_eq!(table.min_bits("sha256d", 0), MAIN_POW_LIMIT_BITS);
        assert_eq!(table.averaging_interval(0), 10);
        assert_eq!(table.target_time_per_block(0), 300);

        let h = PLAN9_ACTIVATION_HEIGHT;
        assert_eq!(table.era(h).num_algos(), 9);
        assert_eq!(table.algo_version("skein", h), Some(6));
        assert_eq!(table.algo_id("skein", h), Some(7));
        assert_eq!(table.algo_name(8, h), Some("x11"));
        assert_eq!(table.min_bits("keccak", h), FIRST_POW_LIMIT_BITS);
        assert_eq!(table.averaging_interval(h), 9600);
        assert_eq!(table.target_time_per_block(h), 9);
    }

    #[test]
    fn test_work_base_is_mean_cost() {
        let table = ForkTable::mainnet();
        assert_eq!(table.era(0).work_base, (824 + 740_839) / 2);
    }

    #[test]
    fn test_random_algo_comes_from_era() {
        let table = ForkTable::mainnet();
        for _ in 0..32 {
            let v = table.algo_version(RANDOM_ALGO, 0).unwrap();
            assert!(v == 2 || v == 514);
        }
        let h = PLAN9_ACTIVATION_HEIGHT;
        for _ in 0..32 {
            let v = table.algo_version(RANDOM_ALGO, h).unwrap();
            assert!(table.algo_name(v, h).is_some());
        }
    }

    #[test]
    fn test_normalize_falls_back_to_default() {
        let table = ForkTable::mainnet();
        assert_eq!(table.normalize_algo("scrypt", 0), (514, "scrypt".to_string()));
        assert_eq!(table.normalize_algo("x11", 0), (2, "sha256d".to_string()));
        let (version, name) = table.normalize_algo(RANDOM_ALGO, 0);
        assert_eq!(table.algo_name(version, 0), Some(name.as_str()));
    }

    #[test]
    fn test_malformed_tables_rejected() {
        assert_eq!(ForkTable::new(vec![], false).unwrap_err(), ForkTableError::Empty);

        let late = HardForkEra::new(
            0,
            "late",
            5,
            5,
            10,
            60,
            REGTEST_POW_LIMIT_BITS,
            &[("sha256d", AlgoParams::new(2, REGTEST_POW_LIMIT_BITS, 0, 1))],
        );
        assert_eq!(
            ForkTable::new(vec![late], false).unwrap_err(),
            ForkTableError::FirstEraNotGenesis(5)
        );

        let empty = HardForkEra::new(0, "empty", 0, 0, 10, 60, REGTEST_POW_LIMIT_BITS, &[]);
        assert_eq!(
            ForkTable::new(vec![empty], false).unwrap_err(),
            ForkTableError::NoAlgorithms(0)
        );

        let mut eras = synthetic(&[0, 100]).eras().to_vec();
        eras[1].activation_height = 0;
        assert_eq!(
            ForkTable::new(eras, false).unwrap_err(),
            ForkTableError::UnorderedActivation(1)
        );

        let dup = HardForkEra::new(
            0,
            "dup",
            0,
            0,
            10,
            60,
            REGTEST_POW_LIMIT_BITS,
            &[
                ("a", AlgoParams::new(2, REGTEST_POW_LIMIT_BITS, 0, 1)),
                ("b", AlgoParams::new(2, REGTEST_POW_LIMIT_BITS, 1, 1)),
            ],
        );
        assert_eq!(
            ForkTable::new(vec![dup], false).unwrap_err(),
            ForkTableError::DuplicateVersion(0, 2)
        );
    }
}
