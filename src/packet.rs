//! Packet structure carried inside frames.
//!
//! A frame's plaintext is exactly one packet:
//!
//! ```text
//!     type        u8      payload (0x00) or prng-seed (0x01)
//!     payload_len u16     big-endian length of the payload
//!     payload     [u8]    application data or control message
//!     padding     [u8]    zero bytes, discarded by the peer
//! ```
//!
//! Padding is what the length distribution buys: a packet carrying one
//! payload byte and 1444 padding bytes is indistinguishable on the wire
//! from a full one. Unknown packet types are silently discarded so new
//! control messages can be deployed without breaking old peers.

use crate::error::{Error, Result};
use crate::framing::{MAX_FRAME_LENGTH, MAX_FRAME_PAYLOAD};
use crate::obfuscation::SEED_LENGTH;

/// Bytes of packet header inside a frame: type plus payload length.
pub const PACKET_OVERHEAD: usize = 3;

/// Largest payload (and also largest padding) a single packet can carry.
pub const MAX_PACKET_PAYLOAD: usize = MAX_FRAME_PAYLOAD - PACKET_OVERHEAD;

/// Expected payload length of a prng-seed control packet.
pub const SEED_PAYLOAD_LENGTH: usize = SEED_LENGTH;

/// Upper bound on a single carrier read while consuming frames.
pub const CONSUME_READ_SIZE: usize = 16 * MAX_FRAME_LENGTH;

/// Packet types understood by this implementation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Application data.
    Payload = 0x00,
    /// A fresh 24-byte seed for the client's outbound length distribution.
    PrngSeed = 0x01,
}

impl PacketType {
    /// Map a wire byte to a known packet type. Unknown bytes map to `None`
    /// and the packet is discarded, counters still advancing.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PacketType::Payload),
            0x01 => Some(PacketType::PrngSeed),
            _ => None,
        }
    }
}

/// Assemble a packet into `pkt`, returning its total length.
///
/// The caller guarantees `data.len() + pad_len <= MAX_PACKET_PAYLOAD`;
/// `pkt` must hold at least `PACKET_OVERHEAD + data.len() + pad_len` bytes.
/// Padding bytes are zero.
pub(crate) fn assemble(pkt: &mut [u8], ty: PacketType, data: &[u8], pad_len: usize) -> usize {
    let total = PACKET_OVERHEAD + data.len() + pad_len;
    debug_assert!(total <= MAX_FRAME_PAYLOAD);

    pkt[0] = ty as u8;
    pkt[1..3].copy_from_slice(&(data.len() as u16).to_be_bytes());
    pkt[3..3 + data.len()].copy_from_slice(data);
    pkt[3 + data.len()..total].fill(0);

    total
}

/// Split a decoded frame into its type byte and payload, validating the
/// header against the frame length.
pub(crate) fn parse(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < PACKET_OVERHEAD {
        return Err(Error::InvalidPacketLength(frame.len()));
    }

    let payload_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
    if payload_len > frame.len() - PACKET_OVERHEAD {
        return Err(Error::InvalidPayloadLength(payload_len));
    }

    Ok((frame[0], &frame[PACKET_OVERHEAD..PACKET_OVERHEAD + payload_len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_parse_roundtrip() {
        let mut pkt = [0u8; MAX_FRAME_PAYLOAD];

        for &(data_len, pad_len) in &[(0usize, 0usize), (0, 100), (13, 0), (1, 1444), (1445, 0)] {
            let data: Vec<u8> = (0..data_len).map(|i| (i % 251) as u8).collect();
            let total = assemble(&mut pkt, PacketType::Payload, &data, pad_len);
            assert_eq!(total, PACKET_OVERHEAD + data_len + pad_len);

            let (ty, payload) = parse(&pkt[..total]).unwrap();
            assert_eq!(ty, PacketType::Payload as u8);
            assert_eq!(payload, data.as_slice());
        }
    }

    #[test]
    fn test_padding_is_zero() {
        let mut pkt = [0xffu8; MAX_FRAME_PAYLOAD];
        let total = assemble(&mut pkt, PacketType::Payload, b"abc", 64);
        assert!(pkt[PACKET_OVERHEAD + 3..total].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_frame_is_invalid_packet() {
        for len in 0..PACKET_OVERHEAD {
            let frame = vec![0u8; len];
            assert!(matches!(
                parse(&frame),
                Err(Error::InvalidPacketLength(n)) if n == len
            ));
        }
    }

    #[test]
    fn test_payload_length_boundaries() {
        // payload_len == frame_len - 3: valid, no padding.
        let mut frame = vec![0u8; 10];
        frame[1..3].copy_from_slice(&7u16.to_be_bytes());
        assert!(parse(&frame).is_ok());

        // payload_len == frame_len - 2: one byte over.
        frame[1..3].copy_from_slice(&8u16.to_be_bytes());
        assert!(matches!(
            parse(&frame),
            Err(Error::InvalidPayloadLength(8))
        ));
    }

    #[test]
    fn test_unknown_types_unmapped() {
        assert_eq!(PacketType::from_wire(0x00), Some(PacketType::Payload));
        assert_eq!(PacketType::from_wire(0x01), Some(PacketType::PrngSeed));
        assert_eq!(PacketType::from_wire(0x42), None);
        assert_eq!(PacketType::from_wire(0xff), None);
    }

    #[test]
    fn test_consume_read_size_covers_full_frames() {
        assert_eq!(CONSUME_READ_SIZE % MAX_FRAME_LENGTH, 0);
        assert!(CONSUME_READ_SIZE >= MAX_FRAME_LENGTH);
    }
}
