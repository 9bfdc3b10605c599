//! Deterministic random byte generation.
//!
//! The generator is a keyed PRF (HMAC-SHA256 under the seed) run in counter
//! mode. Determinism is a wire-compatibility requirement, not a convenience:
//! the peer reproduces this exact stream to predict padding lengths, so two
//! generators built from equal seeds must agree forever, bit for bit.

use rand::RngCore;
use rand_core::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{hmac_sha256, NodeId};

/// Length of a generator seed in bytes.
pub const SEED_LENGTH: usize = 24;

/// A 24-byte generator seed. Immutable after creation.
///
/// Source of all randomness that must be reproducible by the peer.
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; SEED_LENGTH]);

impl Seed {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SEED_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, if it is exactly 24 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; SEED_LENGTH] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Generate a fresh random seed from the OS entropy source.
    pub fn random() -> Self {
        let mut bytes = [0u8; SEED_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the startup seed shared by both peers of a node.
    ///
    /// Used before any keys exist: it shapes handshake message padding, so
    /// it may only depend on public material.
    pub fn derive(node_id: &NodeId) -> Self {
        let digest = hmac_sha256(node_id.as_bytes(), b"veilwire-v1 startup seed");
        let mut bytes = [0u8; SEED_LENGTH];
        bytes.copy_from_slice(&digest[..SEED_LENGTH]);
        Self(bytes)
    }

    /// Get the raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Seeds shape observable traffic; keep them out of logs.
        f.write_str("Seed(..)")
    }
}

/// Deterministic generator over an infinite pseudorandom stream.
pub struct Drbg {
    seed: Seed,
    counter: u64,
}

impl Drbg {
    /// Create a generator positioned at the start of the seed's stream.
    pub fn new(seed: &Seed) -> Self {
        Self {
            seed: seed.clone(),
            counter: 0,
        }
    }

    /// Produce the next 64 bits of the stream.
    pub fn next_u64(&mut self) -> u64 {
        let block = hmac_sha256(self.seed.as_bytes(), &self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        u64::from_be_bytes(block[..8].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_seeds_agree_indefinitely() {
        let seed = Seed::from_bytes([0xa5u8; SEED_LENGTH]);
        let mut a = Drbg::new(&seed);
        let mut b = Drbg::new(&seed);

        for _ in 0..10_000 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = Drbg::new(&Seed::from_bytes([0x00u8; SEED_LENGTH]));
        let mut b = Drbg::new(&Seed::from_bytes([0x01u8; SEED_LENGTH]));

        let va: Vec<u64> = (0..16).map(|_| a.next_u64()).collect();
        let vb: Vec<u64> = (0..16).map(|_| b.next_u64()).collect();
        assert_ne!(va, vb);
    }

    #[test]
    fn test_stream_is_not_constant() {
        let mut drbg = Drbg::new(&Seed::from_bytes([0x42u8; SEED_LENGTH]));
        let first = drbg.next_u64();
        assert!((0..64).any(|_| drbg.next_u64() != first));
    }

    #[test]
    fn test_seed_from_slice() {
        assert!(Seed::from_slice(&[0u8; 23]).is_none());
        assert!(Seed::from_slice(&[0u8; 25]).is_none());
        assert!(Seed::from_slice(&[0u8; 24]).is_some());
    }

    #[test]
    fn test_derived_seed_is_stable() {
        let node_id = NodeId::from_bytes([0x13u8; 20]);
        assert_eq!(Seed::derive(&node_id), Seed::derive(&node_id));

        let other = NodeId::from_bytes([0x14u8; 20]);
        assert_ne!(Seed::derive(&node_id), Seed::derive(&other));
    }
}
