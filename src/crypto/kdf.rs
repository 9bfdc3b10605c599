//! Key derivation for the framed transport.
//!
//! The handshake condenses its transcript into a 72-byte keying material
//! block; HKDF-SHA256 expands that block into the per-direction frame keys
//! and the seed for the outbound length distribution.

use hkdf::Hkdf as HkdfImpl;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{FrameKey, KEY_LENGTH, NONCE_PREFIX_LENGTH};
use crate::error::{Error, Result};
use crate::Role;

/// Length of the per-direction length-distribution seed in bytes.
const LEN_SEED_LENGTH: usize = 24;

/// Length of the handshake keying material block in bytes.
const KEY_MATERIAL_LENGTH: usize = 72;

/// HKDF key derivation using SHA-256.
pub struct Hkdf {
    prk: HkdfImpl<Sha256>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand the PRK to produce output keying material.
    pub fn expand(&self, info: &[u8], len: usize) -> Result<Vec<u8>> {
        let mut okm = vec![0u8; len];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::handshake("HKDF expansion failed"))?;
        Ok(okm)
    }

    /// Expand to a fixed-size array.
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N]> {
        let mut okm = [0u8; N];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::handshake("HKDF expansion failed"))?;
        Ok(okm)
    }
}

/// Compute HMAC-SHA256 over a message.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// The 72-byte keying material block produced by a completed handshake.
///
/// Opaque to everything except [`SessionKeys::derive`].
/// Automatically zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_MATERIAL_LENGTH]);

impl KeyMaterial {
    /// Length of the block in bytes.
    pub const LENGTH: usize = KEY_MATERIAL_LENGTH;

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_MATERIAL_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Expand a 32-byte handshake seed into the keying material block.
    pub fn expand_from(key_seed: &[u8; 32], protocol_id: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::new(Some(protocol_id), key_seed);
        Ok(Self(hkdf.expand_fixed::<KEY_MATERIAL_LENGTH>(
            b"key expansion",
        )?))
    }

    /// Get the raw block bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_MATERIAL_LENGTH] {
        &self.0
    }
}

/// Frame keys and padding seeds for one connection, derived from the
/// handshake keying material.
///
/// The client-to-server block keys the client's tx path and the server's
/// rx path; the server-to-client block is the mirror image. Each block also
/// carries the 24-byte seed for that direction's length distribution, so a
/// peer always knows which distribution governs its own outbound padding.
pub struct SessionKeys {
    tx: FrameKey,
    rx: FrameKey,
    tx_len_seed: LenSeedBytes,
    rx_len_seed: LenSeedBytes,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct LenSeedBytes([u8; LEN_SEED_LENGTH]);

/// Bytes per direction: frame key + nonce prefix + length seed.
const DIRECTION_LENGTH: usize = KEY_LENGTH + NONCE_PREFIX_LENGTH + LEN_SEED_LENGTH;

impl SessionKeys {
    /// Derive the session keys for one side of a connection.
    ///
    /// Both peers call this with the same material and their own role; the
    /// results are mirror images of each other.
    pub fn derive(material: &KeyMaterial, role: Role) -> Self {
        let hkdf = Hkdf::new(None, material.as_bytes());
        let okm: [u8; DIRECTION_LENGTH * 2] = hkdf
            .expand_fixed(b"veilwire-v1 frame keys")
            .expect("output length is valid for HKDF-SHA256");

        let (c2s, s2c) = okm.split_at(DIRECTION_LENGTH);
        let (tx_block, rx_block) = match role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };

        Self {
            tx: Self::frame_key(tx_block),
            rx: Self::frame_key(rx_block),
            tx_len_seed: Self::derive_len_seed(tx_block),
            rx_len_seed: Self::derive_len_seed(rx_block),
        }
    }

    fn frame_key(block: &[u8]) -> FrameKey {
        let key: [u8; KEY_LENGTH] = block[..KEY_LENGTH].try_into().unwrap();
        let prefix: [u8; NONCE_PREFIX_LENGTH] = block
            [KEY_LENGTH..KEY_LENGTH + NONCE_PREFIX_LENGTH]
            .try_into()
            .unwrap();
        FrameKey::from_parts(key, prefix)
    }

    fn derive_len_seed(block: &[u8]) -> LenSeedBytes {
        LenSeedBytes(
            block[KEY_LENGTH + NONCE_PREFIX_LENGTH..]
                .try_into()
                .unwrap(),
        )
    }

    /// Key for the transmit direction.
    pub fn tx(&self) -> &FrameKey {
        &self.tx
    }

    /// Key for the receive direction.
    pub fn rx(&self) -> &FrameKey {
        &self.rx
    }

    /// Seed for this side's outbound length distribution.
    pub fn len_seed(&self) -> &[u8; LEN_SEED_LENGTH] {
        &self.tx_len_seed.0
    }

    /// Seed governing the peer's outbound length distribution.
    pub fn peer_len_seed(&self) -> &[u8; LEN_SEED_LENGTH] {
        &self.rx_len_seed.0
    }
}
