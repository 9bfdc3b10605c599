//! Error types for the veilwire transport.
//!
//! The error model is deliberately flat and fatal: apart from [`Error::Again`],
//! which is internal decoder backpressure, every error that surfaces from an
//! open connection is terminal. The connection transitions to the broken state
//! and all subsequent operations fail with [`Error::InvalidState`].

use thiserror::Error;

/// Result type alias for veilwire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on a veilwire connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Frame plaintext shorter than the packet header.
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(usize),

    /// Declared payload length overruns the frame.
    #[error("invalid payload length: {0}")]
    InvalidPayloadLength(usize),

    /// Frame decryption or authentication failed.
    #[error("frame authentication failed")]
    Aead,

    /// The carrier accepted fewer bytes than offered.
    #[error("short write to carrier")]
    ShortWrite,

    /// Underlying carrier read/write error.
    #[error("carrier error: {0}")]
    Carrier(#[from] std::io::Error),

    /// Operation attempted while the connection is not open.
    #[error("connection is not open")]
    InvalidState,

    /// The frame counter would wrap; the session must terminate.
    #[error("frame nonce counter exhausted")]
    NonceExhausted,

    /// More carrier data is needed before a frame can be decoded.
    ///
    /// Never escapes the connection; the packet consumer treats it as
    /// "drained" and returns to the carrier.
    #[error("need more data to decode frame")]
    Again,

    /// Handshake message could not be parsed or authenticated.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A previously seen handshake was replayed within its epoch window.
    #[error("replayed handshake")]
    Replay,
}

impl Error {
    /// Create a new handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// True for every error that must break an open connection.
    ///
    /// Only [`Error::Again`] is recoverable, and it never crosses the
    /// connection boundary.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Again)
    }
}
