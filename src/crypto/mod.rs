//! Cryptographic primitives for the veilwire transport.
//!
//! This module provides:
//! - X25519 key exchange (ephemeral session keys, long-lived identity keys)
//! - XChaCha20-Poly1305 AEAD frame encryption
//! - HKDF expansion of handshake output into per-direction session keys
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod kdf;
mod keys;

pub use aead::{FrameCipher, FrameKey, FrameNonce};
pub use kdf::{hmac_sha256, Hkdf, KeyMaterial, SessionKeys};
pub use keys::{IdentitySecret, NodeId, PublicKey, SessionSecret, SharedSecret};

/// Size of symmetric frame keys in bytes (256 bits).
pub const KEY_LENGTH: usize = 32;

/// Size of the per-direction nonce prefix in bytes.
pub const NONCE_PREFIX_LENGTH: usize = 16;

/// Size of the XChaCha20-Poly1305 nonce in bytes (prefix + be64 counter).
pub const NONCE_LENGTH: usize = 24;

/// Size of the AEAD authentication tag in bytes (128 bits).
pub const TAG_LENGTH: usize = 16;

/// Size of X25519 public keys in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Size of the server node identifier in bytes.
pub const NODE_ID_LENGTH: usize = 20;
