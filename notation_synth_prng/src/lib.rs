// Deterministic, portable pseudo-random number generator.
//
// Implements xoshiro256++ (Blackman & Vigna, 2019) with SplitMix64 seeding.
// Hand-rolled with zero external dependencies so that output is identical
// across platforms and toolchains.
//
// This crate is the single source of randomness for the whole notation_synth
// pipeline: domain choice, page layout sampling, staff crop margins, and the
// per-page seed handed to the external renderer all draw from one `SynthRng`
// that the driving loop threads through every call by `&mut`. There is no
// global or thread-local generator anywhere in the workspace.
//
// **Critical constraint: determinism.** Every method on `SynthRng` must produce
// identical output given the same prior state. The core generator uses integer
// arithmetic only; the float helpers derive from it bit-exactly.

use serde::{Deserialize, Serialize};

/// Xoshiro256++ PRNG, the pipeline's sole source of randomness.
///
/// A fixed seed plus a deterministic upstream ordering yields a byte-identical
/// dataset: same layouts, same page identifiers, same crops.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SynthRng {
    s: [u64; 4],
}

impl SynthRng {
    /// Create a new PRNG seeded from a `u64`.
    ///
    /// Uses SplitMix64 to expand the seed into the 256-bit internal state.
    /// Two `SynthRng` instances created with the same seed will produce
    /// identical output sequences.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);

        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Generate a uniform `f64` in [0, 1).
    ///
    /// Uses the upper 53 bits of a `u64` to fill the mantissa of an f64.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generate a uniform `f64` in `[low, high)`.
    ///
    /// A degenerate range (`low == high`) returns `low` but still consumes
    /// one draw, so the stream position does not depend on configuration.
    /// Panics if `low > high`.
    pub fn range_f64(&mut self, low: f64, high: f64) -> f64 {
        assert!(low <= high, "range_f64: low must be <= high");
        let unit = self.next_f64();
        if low == high {
            return low;
        }
        low + unit * (high - low)
    }

    /// Generate a uniform random integer in `[low, high)`.
    ///
    /// Uses rejection sampling to avoid modulo bias.
    /// Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "range_u64: low must be less than high");
        let range = high - low;
        if range.is_power_of_two() {
            return low + (self.next_u64() & (range - 1));
        }
        // Rejection sampling to avoid modulo bias.
        let threshold = range.wrapping_neg() % range; // = (2^64 - range) % range
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return low + (r % range);
            }
        }
    }

    /// Generate a uniform random `usize` in `[low, high]` (inclusive on both ends).
    ///
    /// Panics if `low > high`.
    pub fn range_usize_inclusive(&mut self, low: usize, high: usize) -> usize {
        assert!(low <= high, "range_usize_inclusive: low must be <= high");
        self.range_u64(low as u64, high as u64 + 1) as usize
    }

    /// Pick an index with probability proportional to its weight.
    ///
    /// Returns `None` when `weights` is empty or no weight is positive.
    /// Non-positive weights are never chosen.
    pub fn choose_weighted(&mut self, weights: &[f64]) -> Option<usize> {
        let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
        if total <= 0.0 {
            return None;
        }
        let mut target = self.next_f64() * total;
        let mut last_positive = None;
        for (i, &w) in weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            if target < w {
                return Some(i);
            }
            target -= w;
            last_positive = Some(i);
        }
        // Float rounding can leave a sliver past the final bucket.
        last_positive
    }
}

/// SplitMix64, used only for seeding xoshiro256++ from a single `u64`.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinism_same_seed_same_output() {
        let mut a = SynthRng::new(42);
        let mut b = SynthRng::new(42);
        for _ in 0..1000 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seeds_different_output() {
        let mut a = SynthRng::new(42);
        let mut b = SynthRng::new(43);
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn f64_in_unit_range() {
        let mut rng = SynthRng::new(12345);
        for _ in 0..10_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v), "f64 out of range: {v}");
        }
    }

    #[test]
    fn range_f64_within_bounds() {
        let mut rng = SynthRng::new(777);
        for _ in 0..10_000 {
            let v = rng.range_f64(-0.5, 1.5);
            assert!((-0.5..1.5).contains(&v), "range_f64 out of range: {v}");
        }
    }

    #[test]
    fn range_f64_degenerate_consumes_a_draw() {
        let mut a = SynthRng::new(9);
        let mut b = SynthRng::new(9);
        assert_eq!(a.range_f64(2.0, 2.0), 2.0);
        b.next_u64();
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn range_usize_inclusive_reaches_both_ends() {
        let mut rng = SynthRng::new(666);
        let mut seen = [false; 3];
        for _ in 0..10_000 {
            let v = rng.range_usize_inclusive(3, 5);
            assert!((3..=5).contains(&v), "out of range: {v}");
            seen[v - 3] = true;
        }
        assert!(seen.iter().all(|s| *s), "every value should appear: {seen:?}");
    }

    #[test]
    fn range_u64_within_bounds() {
        let mut rng = SynthRng::new(999);
        for _ in 0..10_000 {
            let v = rng.range_u64(10, 20);
            assert!((10..20).contains(&v), "range_u64 out of range: {v}");
        }
    }

    #[test]
    fn choose_weighted_skips_zero_weights() {
        let mut rng = SynthRng::new(1);
        for _ in 0..1000 {
            let i = rng.choose_weighted(&[0.0, 1.0, 0.0, 3.0]).unwrap();
            assert!(i == 1 || i == 3, "picked zero-weight index {i}");
        }
        assert_eq!(rng.choose_weighted(&[]), None);
        assert_eq!(rng.choose_weighted(&[0.0, -1.0]), None);
    }

    #[test]
    fn choose_weighted_follows_weights() {
        let mut rng = SynthRng::new(2024);
        let n = 10_000;
        let heavy = (0..n)
            .filter(|_| rng.choose_weighted(&[1.0, 3.0]) == Some(1))
            .count();
        let pct = heavy as f64 / n as f64;
        assert!((0.70..0.80).contains(&pct), "expected ~75%, got {pct}");
    }

    #[test]
    fn serialization_roundtrip() {
        let mut rng = SynthRng::new(42);
        for _ in 0..100 {
            rng.next_u64();
        }
        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: SynthRng = serde_json::from_str(&json).unwrap();
        for _ in 0..100 {
            assert_eq!(rng.next_u64(), restored.next_u64());
        }
    }
}
