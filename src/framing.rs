//! AEAD frame codec.
//!
//! Post-handshake traffic is an unbounded sequence of records, each:
//!
//! ```text
//!     obf_len : 2 bytes    obfuscated big-endian ciphertext length
//!     ct      : obf_len'   XChaCha20-Poly1305 ciphertext (payload + tag)
//! ```
//!
//! The length prefix is XORed with the first two bytes of a keystream
//! derived from the direction key and the frame nonce, so records of equal
//! size are not directly visible on the wire. Each direction is keyed
//! separately and numbers its frames independently; a decode failure of any
//! kind is fatal to the connection above this layer.

use bytes::{Buf, BytesMut};
use rand::Rng;

use crate::crypto::{FrameCipher, FrameKey, TAG_LENGTH};
use crate::error::{Error, Result};

/// Length of the obfuscated length prefix in bytes.
pub const LENGTH_LENGTH: usize = 2;

/// Framing overhead per record: length prefix plus authentication tag.
pub const FRAME_OVERHEAD: usize = LENGTH_LENGTH + TAG_LENGTH;

/// Largest plaintext payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = 1448;

/// Largest on-wire record, overhead included.
pub const MAX_FRAME_LENGTH: usize = MAX_FRAME_PAYLOAD + FRAME_OVERHEAD;

/// Smallest valid ciphertext length (an empty payload still carries a tag).
const MIN_CIPHERTEXT_LENGTH: usize = TAG_LENGTH;

/// Largest valid ciphertext length.
const MAX_CIPHERTEXT_LENGTH: usize = MAX_FRAME_PAYLOAD + TAG_LENGTH;

/// Encodes plaintext payloads into on-wire records for one direction.
pub struct Encoder {
    cipher: FrameCipher,
}

impl Encoder {
    /// Create an encoder for a direction key. The frame counter starts at 0.
    pub fn new(key: &FrameKey) -> Self {
        Self {
            cipher: FrameCipher::new(key),
        }
    }

    /// Number of frames encoded so far.
    pub fn frames(&self) -> u64 {
        self.cipher.counter()
    }

    /// Encode one record into `frame`, returning the number of bytes
    /// written (`2 + plaintext.len() + 16`). Advances the tx counter.
    ///
    /// Every error is fatal to the connection.
    pub fn encode(&mut self, frame: &mut [u8], plaintext: &[u8]) -> Result<usize> {
        if plaintext.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::InvalidPayloadLength(plaintext.len()));
        }
        let frame_len = LENGTH_LENGTH + plaintext.len() + TAG_LENGTH;
        debug_assert!(frame.len() >= frame_len, "encode buffer too small");
        if frame.len() < frame_len {
            return Err(Error::ShortWrite);
        }

        // The mask belongs to the same nonce the seal consumes.
        let mask = self.cipher.length_mask();

        let ct_end = LENGTH_LENGTH + plaintext.len();
        frame[LENGTH_LENGTH..ct_end].copy_from_slice(plaintext);
        let tag = self.cipher.seal_in_place(&mut frame[LENGTH_LENGTH..ct_end])?;
        frame[ct_end..frame_len].copy_from_slice(&tag);

        let ct_len = (plaintext.len() + TAG_LENGTH) as u16;
        let obf_len = ct_len ^ u16::from_be_bytes(mask);
        frame[..LENGTH_LENGTH].copy_from_slice(&obf_len.to_be_bytes());

        Ok(frame_len)
    }
}

/// Decodes on-wire records back into plaintext payloads for one direction.
pub struct Decoder {
    cipher: FrameCipher,
    /// Substitute ciphertext length adopted after the real one deobfuscated
    /// out of range. Held so repeated polls wait for a consistent byte
    /// count, then fail authentication uniformly.
    pending_invalid: Option<u16>,
}

impl Decoder {
    /// Create a decoder for a direction key. The frame counter starts at 0.
    pub fn new(key: &FrameKey) -> Self {
        Self {
            cipher: FrameCipher::new(key),
            pending_invalid: None,
        }
    }

    /// Number of frames decoded so far.
    pub fn frames(&self) -> u64 {
        self.cipher.counter()
    }

    /// Decode one record out of `recv`, writing the plaintext into `out`
    /// and returning its length.
    ///
    /// Returns [`Error::Again`] without consuming anything while `recv`
    /// holds less than a complete record. A complete record is consumed
    /// atomically; on authentication failure the rx counter stays at the
    /// failing value and the error is fatal.
    pub fn decode(&mut self, out: &mut [u8], recv: &mut BytesMut) -> Result<usize> {
        if recv.len() < LENGTH_LENGTH {
            return Err(Error::Again);
        }

        let ct_len = match self.pending_invalid {
            Some(substitute) => substitute as usize,
            None => {
                let mask = u16::from_be_bytes(self.cipher.length_mask());
                let obf_len = u16::from_be_bytes([recv[0], recv[1]]);
                let ct_len = (obf_len ^ mask) as usize;
                if (MIN_CIPHERTEXT_LENGTH..=MAX_CIPHERTEXT_LENGTH).contains(&ct_len) {
                    ct_len
                } else {
                    // Out-of-range length: pretend it was a random valid
                    // length and let authentication fail once that many
                    // bytes arrive, so a tamperer cannot distinguish a
                    // length error from a tag error.
                    let substitute = rand::thread_rng()
                        .gen_range(MIN_CIPHERTEXT_LENGTH..=MAX_CIPHERTEXT_LENGTH)
                        as u16;
                    self.pending_invalid = Some(substitute);
                    substitute as usize
                }
            }
        };

        if recv.len() < LENGTH_LENGTH + ct_len {
            return Err(Error::Again);
        }

        // The record is complete; consume it whole.
        recv.advance(LENGTH_LENGTH);
        let ct = recv.split_to(ct_len);

        if self.pending_invalid.take().is_some() {
            return Err(Error::Aead);
        }

        let pt_len = ct_len - TAG_LENGTH;
        debug_assert!(out.len() >= pt_len, "decode buffer too small");
        out[..pt_len].copy_from_slice(&ct[..pt_len]);
        let tag: [u8; TAG_LENGTH] = ct[pt_len..].try_into().unwrap();
        self.cipher.open_in_place(&mut out[..pt_len], &tag)?;

        Ok(pt_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KEY_LENGTH, NONCE_PREFIX_LENGTH};

    fn codec_pair() -> (Encoder, Decoder) {
        let key = FrameKey::from_parts([0x24u8; KEY_LENGTH], [0x42u8; NONCE_PREFIX_LENGTH]);
        (Encoder::new(&key), Decoder::new(&key))
    }

    #[test]
    fn test_roundtrip_all_boundary_sizes() {
        let (mut enc, mut dec) = codec_pair();
        let mut recv = BytesMut::new();

        for &len in &[0usize, 1, 2, 3, 100, 1447, MAX_FRAME_PAYLOAD] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            let mut frame = [0u8; MAX_FRAME_LENGTH];
            let n = enc.encode(&mut frame, &payload).unwrap();
            assert_eq!(n, LENGTH_LENGTH + len + TAG_LENGTH);

            recv.extend_from_slice(&frame[..n]);
            let mut out = [0u8; MAX_FRAME_PAYLOAD];
            let decoded = dec.decode(&mut out, &mut recv).unwrap();
            assert_eq!(decoded, len);
            assert_eq!(&out[..decoded], payload.as_slice());
            assert!(recv.is_empty());
        }
    }

    #[test]
    fn test_counters_advance_in_lockstep() {
        let (mut enc, mut dec) = codec_pair();
        let mut recv = BytesMut::new();

        for i in 0u64..32 {
            assert_eq!(enc.frames(), i);
            assert_eq!(dec.frames(), i);

            let mut frame = [0u8; MAX_FRAME_LENGTH];
            let n = enc.encode(&mut frame, b"tick").unwrap();
            recv.extend_from_slice(&frame[..n]);

            let mut out = [0u8; MAX_FRAME_PAYLOAD];
            dec.decode(&mut out, &mut recv).unwrap();
        }
        assert_eq!(enc.frames(), 32);
        assert_eq!(dec.frames(), 32);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (mut enc, _) = codec_pair();
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let mut frame = [0u8; MAX_FRAME_LENGTH + 32];
        assert!(matches!(
            enc.encode(&mut frame, &payload),
            Err(Error::InvalidPayloadLength(_))
        ));
    }

    #[test]
    fn test_partial_record_never_consumes() {
        let (mut enc, mut dec) = codec_pair();

        let mut frame = [0u8; MAX_FRAME_LENGTH];
        let n = enc.encode(&mut frame, b"partial delivery").unwrap();

        let mut recv = BytesMut::new();
        let mut out = [0u8; MAX_FRAME_PAYLOAD];

        // Feed the record one byte at a time; every short poll leaves the
        // buffer untouched.
        for (fed, &byte) in frame[..n].iter().enumerate() {
            if fed + 1 < n {
                recv.extend_from_slice(&[byte]);
                assert!(matches!(dec.decode(&mut out, &mut recv), Err(Error::Again)));
                assert_eq!(recv.len(), fed + 1);
            } else {
                recv.extend_from_slice(&[byte]);
                let decoded = dec.decode(&mut out, &mut recv).unwrap();
                assert_eq!(&out[..decoded], b"partial delivery");
                assert!(recv.is_empty());
            }
        }
    }

    #[test]
    fn test_single_bit_flips_are_fatal() {
        for bit in 0..8 {
            for pos in [0usize, 1, 2, 10, 20, 33] {
                let (mut enc, mut dec) = codec_pair();

                let mut frame = [0u8; MAX_FRAME_LENGTH];
                let n = enc.encode(&mut frame, b"bits under test!").unwrap();
                assert!(pos < n);
                frame[pos] ^= 1 << bit;

                let mut recv = BytesMut::new();
                recv.extend_from_slice(&frame[..n]);

                let mut out = [0u8; MAX_FRAME_PAYLOAD];
                // A flipped length byte may leave the decoder waiting for a
                // longer (garbage) record; top it up until it resolves.
                let verdict = loop {
                    match dec.decode(&mut out, &mut recv) {
                        Err(Error::Again) => recv.extend_from_slice(&[0u8; 256]),
                        other => break other,
                    }
                };
                assert!(matches!(verdict, Err(Error::Aead)), "pos={pos} bit={bit}");
                assert_eq!(dec.frames(), 0);
            }
        }
    }

    #[test]
    fn test_out_of_range_length_fails_uniformly() {
        let (mut enc, mut dec) = codec_pair();

        let mut frame = [0u8; MAX_FRAME_LENGTH];
        let n = enc.encode(&mut frame, b"x").unwrap();

        // Corrupt the prefix so it deobfuscates to a huge length.
        frame[0] ^= 0xff;
        frame[1] ^= 0xff;

        let mut recv = BytesMut::new();
        recv.extend_from_slice(&frame[..n]);

        let mut out = [0u8; MAX_FRAME_PAYLOAD];
        let verdict = loop {
            match dec.decode(&mut out, &mut recv) {
                Err(Error::Again) => recv.extend_from_slice(&[0u8; 256]),
                other => break other,
            }
        };
        assert!(matches!(verdict, Err(Error::Aead)));
        assert_eq!(dec.frames(), 0);
    }

    #[test]
    fn test_wire_length_not_cleartext() {
        // Frames with identical payloads must not keep showing one length
        // prefix, and the prefix stream must not equal the raw ciphertext
        // length.
        let (mut enc, _) = codec_pair();

        let raw_len = (b"same payload".len() + TAG_LENGTH) as u16;
        let mut prefixes = Vec::new();
        for _ in 0..8 {
            let mut frame = [0u8; MAX_FRAME_LENGTH];
            enc.encode(&mut frame, b"same payload").unwrap();
            prefixes.push(u16::from_be_bytes([frame[0], frame[1]]));
        }

        assert!(prefixes.iter().any(|&p| p != raw_len));
        assert!(prefixes.iter().any(|&p| p != prefixes[0]));
    }
}
