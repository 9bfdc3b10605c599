//! Frame encryption with XChaCha20-Poly1305.
//!
//! Each direction of a connection owns one [`FrameCipher`]. The 24-byte
//! nonce is a fixed 16-byte prefix followed by a big-endian frame counter;
//! the counter starts at 0, advances by exactly 1 per frame, and must never
//! wrap. Nothing nonce-related crosses the wire: both peers track the
//! counter implicitly because the carrier is reliable and ordered.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, Tag, XChaCha20Poly1305, XNonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::kdf::hmac_sha256;
use crate::crypto::{KEY_LENGTH, NONCE_LENGTH, NONCE_PREFIX_LENGTH, TAG_LENGTH};
use crate::error::{Error, Result};

/// Key material for one direction of a connection: the AEAD key plus the
/// fixed nonce prefix.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FrameKey {
    key: [u8; KEY_LENGTH],
    nonce_prefix: [u8; NONCE_PREFIX_LENGTH],
}

impl FrameKey {
    /// Assemble a frame key from its parts.
    pub fn from_parts(key: [u8; KEY_LENGTH], nonce_prefix: [u8; NONCE_PREFIX_LENGTH]) -> Self {
        Self { key, nonce_prefix }
    }

    pub(crate) fn key_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    pub(crate) fn nonce_prefix(&self) -> &[u8; NONCE_PREFIX_LENGTH] {
        &self.nonce_prefix
    }
}

/// The per-direction frame nonce: fixed prefix plus monotone counter.
pub struct FrameNonce {
    prefix: [u8; NONCE_PREFIX_LENGTH],
    counter: u64,
    exhausted: bool,
}

impl FrameNonce {
    fn new(prefix: [u8; NONCE_PREFIX_LENGTH]) -> Self {
        Self {
            prefix,
            counter: 0,
            exhausted: false,
        }
    }

    /// The counter of the next frame in this direction.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn bytes(&self) -> [u8; NONCE_LENGTH] {
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce[..NONCE_PREFIX_LENGTH].copy_from_slice(&self.prefix);
        nonce[NONCE_PREFIX_LENGTH..].copy_from_slice(&self.counter.to_be_bytes());
        nonce
    }

    /// Advance to the next frame. The counter must not wrap; once the final
    /// value has been used this direction is permanently exhausted.
    fn advance(&mut self) {
        match self.counter.checked_add(1) {
            Some(next) => self.counter = next,
            None => self.exhausted = true,
        }
    }
}

/// Stateful AEAD cipher for one direction of a connection.
pub struct FrameCipher {
    cipher: XChaCha20Poly1305,
    mask_key: MaskKey,
    nonce: FrameNonce,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct MaskKey([u8; KEY_LENGTH]);

impl FrameCipher {
    /// Create a cipher from a direction's frame key. The counter starts at 0.
    pub fn new(key: &FrameKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.key_bytes().into()),
            mask_key: MaskKey(*key.key_bytes()),
            nonce: FrameNonce::new(*key.nonce_prefix()),
        }
    }

    /// Counter of the next frame in this direction.
    pub fn counter(&self) -> u64 {
        self.nonce.counter()
    }

    /// Keystream bytes that obfuscate the current frame's length prefix.
    ///
    /// Derived from the direction key and the current nonce, so the mask
    /// changes every frame and the peer can reproduce it without any
    /// plaintext length leaking on the wire.
    pub fn length_mask(&self) -> [u8; 2] {
        let digest = hmac_sha256(&self.mask_key.0, &self.nonce.bytes());
        [digest[0], digest[1]]
    }

    /// Encrypt `buf` in place under the current nonce and advance the
    /// counter. Returns the detached authentication tag.
    pub fn seal_in_place(&mut self, buf: &mut [u8]) -> Result<[u8; TAG_LENGTH]> {
        if self.nonce.exhausted {
            return Err(Error::NonceExhausted);
        }
        let nonce_bytes = self.nonce.bytes();
        let tag = self
            .cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce_bytes), b"", buf)
            .map_err(|_| Error::Aead)?;
        self.nonce.advance();
        Ok(tag.into())
    }

    /// Decrypt `buf` in place under the current nonce, verifying `tag`.
    ///
    /// The counter advances only on success; a failed frame leaves the
    /// cipher at the failing counter value, and the connection above this
    /// layer is torn down.
    pub fn open_in_place(&mut self, buf: &mut [u8], tag: &[u8; TAG_LENGTH]) -> Result<()> {
        if self.nonce.exhausted {
            return Err(Error::NonceExhausted);
        }
        let nonce_bytes = self.nonce.bytes();
        self.cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&nonce_bytes),
                b"",
                buf,
                Tag::from_slice(tag),
            )
            .map_err(|_| Error::Aead)?;
        self.nonce.advance();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> FrameKey {
        FrameKey::from_parts([0x42u8; KEY_LENGTH], [0x17u8; NONCE_PREFIX_LENGTH])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let mut tx = FrameCipher::new(&test_key());
        let mut rx = FrameCipher::new(&test_key());

        for i in 0u64..4 {
            assert_eq!(tx.counter(), i);
            let mut buf = *b"sealed frame payload";
            let tag = tx.seal_in_place(&mut buf).unwrap();
            assert_ne!(&buf, b"sealed frame payload");

            rx.open_in_place(&mut buf, &tag).unwrap();
            assert_eq!(&buf, b"sealed frame payload");
            assert_eq!(rx.counter(), i + 1);
        }
    }

    #[test]
    fn test_tampered_tag_fails() {
        let mut tx = FrameCipher::new(&test_key());
        let mut rx = FrameCipher::new(&test_key());

        let mut buf = *b"payload";
        let mut tag = tx.seal_in_place(&mut buf).unwrap();
        tag[0] ^= 0x01;

        assert!(matches!(rx.open_in_place(&mut buf, &tag), Err(Error::Aead)));
        // The failing frame does not advance the receive counter.
        assert_eq!(rx.counter(), 0);
    }

    #[test]
    fn test_counter_mismatch_fails() {
        let mut tx = FrameCipher::new(&test_key());
        let mut rx = FrameCipher::new(&test_key());

        // Sender at frame 1, receiver still expects frame 0.
        let mut skipped = *b"frame zero";
        let _ = tx.seal_in_place(&mut skipped).unwrap();

        let mut buf = *b"frame one";
        let tag = tx.seal_in_place(&mut buf).unwrap();
        assert!(matches!(rx.open_in_place(&mut buf, &tag), Err(Error::Aead)));
    }

    #[test]
    fn test_length_mask_varies_per_frame() {
        let mut tx = FrameCipher::new(&test_key());

        let mask0 = tx.length_mask();
        let mut later = Vec::new();
        for _ in 0..4 {
            let mut buf = [0u8; 8];
            tx.seal_in_place(&mut buf).unwrap();
            later.push(tx.length_mask());
        }

        // Masks for successive frames are independent keystream draws.
        assert!(later.iter().any(|m| *m != mask0));
    }

    #[test]
    fn test_mask_agrees_across_directions() {
        let tx = FrameCipher::new(&test_key());
        let rx = FrameCipher::new(&test_key());
        assert_eq!(tx.length_mask(), rx.length_mask());
    }
}
