//! Seeded padding-length distribution.
//!
//! A discrete distribution over [0, 1448] built by drawing weighted buckets
//! from a [`Drbg`]. Peers constructing a distribution from the same seed
//! produce the same bucket table and the same sample sequence, which lets a
//! server predict the padding behavior it asked a client to adopt.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::framing::MAX_FRAME_PAYLOAD;
use crate::obfuscation::{Drbg, Seed};

/// Smallest number of weighted buckets in a generated table.
const MIN_BUCKETS: u64 = 16;

/// Largest number of weighted buckets in a generated table.
const MAX_BUCKETS: u64 = 64;

/// Largest weight assigned to a single bucket.
const MAX_WEIGHT: u64 = 1000;

/// A shared handle to a seeded length distribution.
///
/// Cloning yields another handle to the same state: the tx path samples
/// while the rx path may concurrently [`reset`](LenDist::reset) it, and the
/// swap is atomic with respect to sampling.
#[derive(Clone)]
pub struct LenDist {
    inner: Arc<Mutex<DistTable>>,
}

struct DistTable {
    /// Bucket values, parallel to `cumulative`.
    values: Vec<u16>,
    /// Cumulative weights; the last entry is the total weight.
    cumulative: Vec<u64>,
    drbg: Drbg,
}

impl LenDist {
    /// Build a distribution from a seed.
    pub fn new(seed: &Seed) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DistTable::generate(seed))),
        }
    }

    /// Draw a length in [0, 1448].
    ///
    /// Consumes the internal generator, so successive samples walk the
    /// seed's deterministic sequence.
    pub fn sample(&self) -> u16 {
        self.inner.lock().sample()
    }

    /// Replace the distribution with one built from `seed`.
    ///
    /// The whole table and generator are swapped under the lock; a
    /// concurrent sample sees either the old distribution or the new one,
    /// never a half-updated table.
    pub fn reset(&self, seed: &Seed) {
        *self.inner.lock() = DistTable::generate(seed);
    }

    /// Pin the distribution to a single value. Test hook.
    #[cfg(test)]
    pub(crate) fn set_fixed(&self, value: u16) {
        let mut table = self.inner.lock();
        table.values = vec![value];
        table.cumulative = vec![1];
    }
}

impl DistTable {
    fn generate(seed: &Seed) -> Self {
        let mut drbg = Drbg::new(seed);

        let bucket_count = MIN_BUCKETS + drbg.next_u64() % (MAX_BUCKETS - MIN_BUCKETS + 1);
        let mut values = Vec::with_capacity(bucket_count as usize);
        let mut cumulative = Vec::with_capacity(bucket_count as usize);

        let mut total = 0u64;
        for _ in 0..bucket_count {
            values.push((drbg.next_u64() % (MAX_FRAME_PAYLOAD as u64 + 1)) as u16);
            total += 1 + drbg.next_u64() % MAX_WEIGHT;
            cumulative.push(total);
        }

        Self {
            values,
            cumulative,
            drbg,
        }
    }

    fn sample(&mut self) -> u16 {
        let total = *self.cumulative.last().expect("table is never empty");
        let target = self.drbg.next_u64() % total;

        let idx = self.cumulative.partition_point(|&c| c <= target);
        self.values[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::SEED_LENGTH;

    #[test]
    fn test_samples_in_range() {
        let dist = LenDist::new(&Seed::from_bytes([0x07u8; SEED_LENGTH]));
        for _ in 0..10_000 {
            assert!(dist.sample() as usize <= MAX_FRAME_PAYLOAD);
        }
    }

    #[test]
    fn test_equal_seeds_equal_sample_sequences() {
        let seed = Seed::from_bytes([0x3cu8; SEED_LENGTH]);
        let a = LenDist::new(&seed);
        let b = LenDist::new(&seed);

        let sa: Vec<u16> = (0..1000).map(|_| a.sample()).collect();
        let sb: Vec<u16> = (0..1000).map(|_| b.sample()).collect();
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_reset_rebases_the_sequence() {
        let first = Seed::from_bytes([0x01u8; SEED_LENGTH]);
        let second = Seed::from_bytes([0x02u8; SEED_LENGTH]);

        let dist = LenDist::new(&first);
        for _ in 0..100 {
            dist.sample();
        }
        dist.reset(&second);

        // After the reset the handle behaves like a fresh distribution.
        let fresh = LenDist::new(&second);
        let after: Vec<u16> = (0..1000).map(|_| dist.sample()).collect();
        let expected: Vec<u16> = (0..1000).map(|_| fresh.sample()).collect();
        assert_eq!(after, expected);
    }

    #[test]
    fn test_clone_shares_state() {
        let dist = LenDist::new(&Seed::from_bytes([0x55u8; SEED_LENGTH]));
        let handle = dist.clone();

        // Interleaved samples across handles walk one sequence, not two.
        let solo = LenDist::new(&Seed::from_bytes([0x55u8; SEED_LENGTH]));
        for i in 0..100 {
            let expected = solo.sample();
            let got = if i % 2 == 0 {
                dist.sample()
            } else {
                handle.sample()
            };
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_distribution_has_spread() {
        let dist = LenDist::new(&Seed::from_bytes([0x99u8; SEED_LENGTH]));
        let unique: std::collections::HashSet<u16> = (0..1000).map(|_| dist.sample()).collect();
        assert!(unique.len() > 1);
    }
}
