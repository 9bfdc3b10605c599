//! Inter-arrival-time obfuscation.
//!
//! Length padding hides how much is said; write timing still leaks when it
//! is said. The shaper draws per-frame delays from the session's
//! deterministic generator so the pattern is reproducible from the seed and
//! carries no fresh side channel.

use sha2::{Digest, Sha256};

use crate::obfuscation::{Drbg, Seed, SEED_LENGTH};

/// Upper bound on a single inter-frame delay, in microseconds.
const MAX_DELAY_US: u64 = 5_000;

/// Inter-arrival-time obfuscation policy for the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IatMode {
    /// Frames are written back to back.
    #[default]
    Off,
    /// A sampled delay is inserted between frames.
    Normal,
    /// Delays plus sampled write lengths: large writes are additionally
    /// split at distribution-sampled boundaries.
    Paranoid,
}

/// Per-connection delay sampler.
pub struct IatShaper {
    mode: IatMode,
    drbg: Drbg,
}

impl IatShaper {
    /// Create a shaper whose delay stream is derived from the session's
    /// length seed (hashed, so delays and lengths draw from distinct
    /// streams).
    pub fn new(mode: IatMode, len_seed: &[u8; SEED_LENGTH]) -> Self {
        let digest = Sha256::digest(len_seed);
        let mut seed_bytes = [0u8; SEED_LENGTH];
        seed_bytes.copy_from_slice(&digest[..SEED_LENGTH]);

        Self {
            mode,
            drbg: Drbg::new(&Seed::from_bytes(seed_bytes)),
        }
    }

    /// The active policy.
    pub fn mode(&self) -> IatMode {
        self.mode
    }

    /// Delay to insert after the next frame, in microseconds. Zero when the
    /// shaper is off.
    pub fn sample_delay_us(&mut self) -> u64 {
        match self.mode {
            IatMode::Off => 0,
            IatMode::Normal | IatMode::Paranoid => self.drbg.next_u64() % MAX_DELAY_US,
        }
    }
}
