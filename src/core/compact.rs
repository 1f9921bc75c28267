//! Compact difficulty encoding
//!
//! Difficulty targets are 256-bit unsigned numbers stored in block headers
//! in a 32-bit "compact" form that behaves like a tiny floating point value:
//!
//! ```text
//! -------------------------------------------------
//! |   Exponent     |    Sign    |    Mantissa     |
//! -------------------------------------------------
//! | 8 bits [31-24] | 1 bit [23] | 23 bits [22-00] |
//! -------------------------------------------------
//! N = (-1^sign) * mantissa * 256^(exponent-3)
//! ```
//!
//! Decoding is exact. Encoding keeps only 23 bits of mantissa, so
//! `big_to_compact` is lossy for arbitrary integers but round-trips every
//! value it produced itself.

use crate::core::block::Hash256;
use crate::core::fork::ForkTable;
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, Signed, Zero};

/// Mask of the 23 mantissa bits.
const MANTISSA_MASK: u32 = 0x007f_ffff;

/// The sign bit of a compact value.
const SIGN_BIT: u32 = 0x0080_0000;

/// Convert a compact representation to an arbitrary-precision integer.
pub fn compact_to_big(compact: u32) -> BigInt {
    let mut mantissa = compact & MANTISSA_MASK;
    let is_negative = compact & SIGN_BIT != 0;
    let exponent = compact >> 24;

    // The exponent counts bytes, so shifting by whole bytes is the same as
    // multiplying by 256^(exponent-3).
    let bn = if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent);
        BigInt::from(mantissa)
    } else {
        BigInt::from(mantissa) << (8 * (exponent as usize - 3))
    };

    if is_negative {
        -bn
    } else {
        bn
    }
}

/// Convert an integer to its compact representation.
///
/// Only the most significant 23 bits survive.
pub fn big_to_compact(n: &BigInt) -> u32 {
    if n.is_zero() {
        return 0;
    }

    let magnitude = n.magnitude();
    let mut exponent = ((magnitude.bits() + 7) / 8) as u32;

    let mut mantissa = if exponent <= 3 {
        low_u32(magnitude) << (8 * (3 - exponent))
    } else {
        low_u32(&(magnitude >> (8 * (exponent as usize - 3))))
    };

    // A mantissa with the sign bit already set would read back negative, so
    // give up one more byte of precision.
    if mantissa & SIGN_BIT != 0 {
        mantissa >>= 8;
        exponent += 1;
    }

    let mut compact = (exponent << 24) | mantissa;
    if n.is_negative() {
        compact |= SIGN_BIT;
    }
    compact
}

fn low_u32(n: &BigUint) -> u32 {
    n.iter_u32_digits().next().unwrap_or(0)
}

/// Interpret a little-endian hash as a number for target comparison.
pub fn hash_to_big(hash: &Hash256) -> BigUint {
    BigUint::from_bytes_le(hash.as_bytes())
}

/// Work represented by a block with the given bits.
///
/// The target is first scaled by the algorithm's nanoseconds-per-hash
/// relative to the era's work base, so blocks of slow and fast algorithms
/// carry comparable weight. The result is `2^256 / (scaled + 1)`, or zero
/// for a non-positive scaled target.
pub fn calc_work(bits: u32, height: i32, version: i32, forks: &ForkTable) -> BigUint {
    let era = forks.era(height);
    let ns_per_op = era
        .algo_vers
        .get(&version)
        .and_then(|name| era.algos.get(name))
        .map(|algo| algo.ns_per_op)
        .unwrap_or(0);

    if era.work_base <= 0 {
        return BigUint::zero();
    }

    let difficulty_num = compact_to_big(bits) * BigInt::from(ns_per_op) / BigInt::from(era.work_base);
    if difficulty_num.sign() != Sign::Plus {
        return BigUint::zero();
    }

    let denominator = difficulty_num.magnitude() + BigUint::one();
    (BigUint::one() << 256usize) / denominator
}
