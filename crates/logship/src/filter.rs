// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Approximate membership for record deduplication.
//!
//! A classic Bloom filter: "definitely not seen" answers are exact, "possibly seen"
//! answers are wrong at a rate fixed by the sizing given at construction. The filter
//! only grows; there is no removal and no reset. Once more distinct records than the
//! configured capacity have been inserted, the false positive rate climbs past its
//! target, see [`BloomFilter::estimated_false_positive_rate`].

use fnv::FnvHasher;
use std::hash::Hasher;

const SECOND_HASH_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Digest of a record's bytes. Two well mixed 64-bit hashes are expanded into as many
/// bit positions as the filter needs (Kirsch-Mitzenmacher double hashing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    h1: u64,
    h2: u64,
}

impl Fingerprint {
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(bytes);
        let raw = hasher.finish();
        Self {
            h1: mix64(raw),
            // odd, so successive hashes never collapse onto one position
            h2: mix64(raw ^ SECOND_HASH_SALT) | 1,
        }
    }

    fn position(&self, hash: u32, num_bits: usize) -> usize {
        let combined = self
            .h1
            .wrapping_add(u64::from(hash).wrapping_mul(self.h2));
        (combined % num_bits as u64) as usize
    }
}

/// splitmix64 finalizer
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
    /// Insertions that set at least one new bit, i.e. an estimate of distinct records.
    len: usize,
}

/// Largest bit vector a filter will allocate (1 GiB).
pub const MAX_BITS: usize = 1 << 33;

impl BloomFilter {
    /// Filter with an explicit geometry. Zero values are raised to one.
    #[must_use]
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(1);
        Self {
            bits: vec![0; num_bits.div_ceil(64)],
            num_bits,
            num_hashes: num_hashes.max(1),
            len: 0,
        }
    }

    /// Filter sized so that `capacity` distinct insertions keep the false positive
    /// rate at `false_positive_rate`. The bit vector never exceeds [`MAX_BITS`].
    #[must_use]
    pub fn with_rate(capacity: usize, false_positive_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let num_bits = optimal_num_bits(capacity, false_positive_rate).unwrap_or(MAX_BITS);
        Self::new(num_bits, optimal_num_hashes(capacity, num_bits))
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        (0..self.num_hashes).all(|hash| {
            let bit = fingerprint.position(hash, self.num_bits);
            self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Marks `fingerprint` as seen. Returns false when every bit was already set.
    pub fn insert(&mut self, fingerprint: &Fingerprint) -> bool {
        let mut changed = false;
        for hash in 0..self.num_hashes {
            let bit = fingerprint.position(hash, self.num_bits);
            let word = &mut self.bits[bit / 64];
            let mask = 1u64 << (bit % 64);
            changed |= *word & mask == 0;
            *word |= mask;
        }
        if changed {
            self.len += 1;
        }
        changed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.bits.len() * std::mem::size_of::<u64>()
    }

    /// Current false positive probability, from the fraction of bits set.
    #[must_use]
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let set_bits: u64 = self.bits.iter().map(|word| u64::from(word.count_ones())).sum();
        let fill = set_bits as f64 / self.num_bits as f64;
        fill.powi(self.num_hashes as i32)
    }
}

/// Bits needed for `capacity` insertions at `false_positive_rate`, or `None` when that
/// is more than [`MAX_BITS`].
#[must_use]
pub fn optimal_num_bits(capacity: usize, false_positive_rate: f64) -> Option<usize> {
    let ln2 = std::f64::consts::LN_2;
    let rate = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.999_999);
    let bits = (-(capacity as f64) * rate.ln() / (ln2 * ln2)).ceil();
    (bits <= MAX_BITS as f64).then_some(bits as usize)
}

fn optimal_num_hashes(capacity: usize, num_bits: usize) -> u32 {
    let ln2 = std::f64::consts::LN_2;
    ((num_bits as f64 / capacity as f64) * ln2).round().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(i: usize) -> Vec<u8> {
        format!(r#"{{"id":{i},"msg":"request served"}}"#).into_bytes()
    }

    #[test]
    fn test_sizing_matches_standard_formulas() {
        let filter = BloomFilter::with_rate(1000, 0.01);
        // m = -n ln p / ln2^2 = 9585.06, k = m/n ln2 = 6.64
        assert_eq!(filter.num_bits(), 9586);
        assert_eq!(filter.num_hashes(), 7);
        assert_eq!(filter.memory_usage(), 150 * 8);
    }

    #[test]
    fn test_oversized_filter_is_refused() {
        assert_eq!(optimal_num_bits(usize::MAX, 0.001), None);
        assert_eq!(optimal_num_bits(1_000_000_000, 1e-300), None);
        assert_eq!(optimal_num_bits(1000, 0.01), Some(9586));
    }

    #[test]
    fn test_inserted_records_are_found() {
        let mut filter = BloomFilter::with_rate(100, 0.01);
        let seen = Fingerprint::of(br#"{"msg":"hi"}"#);

        assert!(!filter.contains(&seen));
        assert!(filter.insert(&seen));
        assert!(filter.contains(&seen));
        assert!(!filter.insert(&seen));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_degenerate_geometry_is_usable() {
        let mut filter = BloomFilter::new(0, 0);
        assert_eq!(filter.num_bits(), 1);
        assert_eq!(filter.num_hashes(), 1);
        let fingerprint = Fingerprint::of(b"x");
        filter.insert(&fingerprint);
        assert!(filter.contains(&fingerprint));
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let capacity = 10_000;
        let target = 0.01;
        let mut filter = BloomFilter::with_rate(capacity, target);
        for i in 0..capacity {
            filter.insert(&Fingerprint::of(&record(i)));
        }

        let trials = 20_000;
        let false_positives = (capacity..capacity + trials)
            .filter(|i| filter.contains(&Fingerprint::of(&record(*i))))
            .count();
        let rate = false_positives as f64 / trials as f64;

        // Expected 200 hits with a standard deviation of about 14.
        assert!(rate < 2.0 * target, "false positive rate too high: {rate}");
        let estimate = filter.estimated_false_positive_rate();
        assert!(estimate < 2.0 * target, "estimate too high: {estimate}");
    }

    #[test]
    fn test_overfilled_filter_reports_higher_rate() {
        let mut filter = BloomFilter::with_rate(100, 0.01);
        for i in 0..100 {
            filter.insert(&Fingerprint::of(&record(i)));
        }
        let at_capacity = filter.estimated_false_positive_rate();
        for i in 100..1000 {
            filter.insert(&Fingerprint::of(&record(i)));
        }

        assert!(filter.estimated_false_positive_rate() > 10.0 * at_capacity);
    }

    proptest! {
        #[test]
        fn no_false_negatives(records in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..200)) {
            let mut filter = BloomFilter::with_rate(records.len(), 0.01);
            for record in &records {
                filter.insert(&Fingerprint::of(record));
            }
            for record in &records {
                prop_assert!(filter.contains(&Fingerprint::of(record)));
            }
        }
    }
}
