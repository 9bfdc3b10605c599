//! Traffic shaping for the framed transport.
//!
//! Everything here is driven by a deterministic generator so that both
//! peers, given the same 24-byte seed, make identical shaping decisions:
//!
//! 1. **Drbg**: seeded, reproducible pseudorandom stream
//! 2. **LenDist**: discrete padding-length distribution sampled per frame
//! 3. **IatShaper**: optional inter-arrival-time obfuscation between frames

mod drbg;
mod iat;
mod lendist;

pub use drbg::{Drbg, Seed, SEED_LENGTH};
pub use iat::{IatMode, IatShaper};
pub use lendist::LenDist;
