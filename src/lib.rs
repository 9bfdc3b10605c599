//! # veilwire
//!
//! A framed-packet obfuscation transport: turns a reliable, ordered byte
//! pipe (the carrier, typically TCP) into a second byte pipe whose traffic
//! reveals nothing about the endpoints, the payload, or the statistical
//! shape of the conversation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │       Application (dispatcher, SOCKS front-end)          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection (handshake, packet I/O, broken-state latch) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Packet Layer (type, payload, distribution padding)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Framing (length-obfuscated AEAD records per direction) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto (X25519 ntor handshake, HKDF, XChaCha20-P1305)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: fixed-overhead AEAD records with obfuscated
//!    length prefixes and seeded padding defeat length-based analysis
//! 2. **Forward secrecy**: per-connection ephemeral X25519 keys
//! 3. **Fail-closed**: every protocol violation is fatal; a broken
//!    connection never recovers and never leaks an error oracle
//!
//! The crate deliberately stops at the byte-pipe boundary: listeners,
//! proxy modes, key distribution, and transport selection belong to the
//! surrounding dispatcher.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod conn;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod obfuscation;
pub mod packet;

pub use conn::{Connection, ReadHalf, WriteHalf};
pub use error::{Error, Result};
pub use obfuscation::IatMode;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::{IdentitySecret, NodeId, PublicKey};
use crate::handshake::ReplayFilter;

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the connection and the handshake.
    Client,
    /// Holds the long-lived identity key and answers handshakes.
    Server,
}

/// Configuration for the connecting side.
#[derive(Clone)]
pub struct ClientConfig {
    /// Identifier of the server node.
    pub node_id: NodeId,
    /// The server's long-lived identity public key.
    pub server_public: PublicKey,
    /// Write-timing obfuscation policy.
    pub iat_mode: IatMode,
}

impl ClientConfig {
    /// Create a client configuration for one server.
    pub fn new(node_id: NodeId, server_public: PublicKey) -> Self {
        Self {
            node_id,
            server_public,
            iat_mode: IatMode::default(),
        }
    }

    /// Set the write-timing obfuscation policy.
    pub fn with_iat_mode(mut self, mode: IatMode) -> Self {
        self.iat_mode = mode;
        self
    }
}

/// Configuration for the accepting side.
///
/// Clone one instance across all connections of a listener: the handshake
/// replay filter lives in the configuration, and it only protects
/// connections that share it.
#[derive(Clone)]
pub struct ServerConfig {
    /// Identifier of this node.
    pub node_id: NodeId,
    /// Write-timing obfuscation policy.
    pub iat_mode: IatMode,
    identity: IdentitySecret,
    replay: Arc<Mutex<ReplayFilter>>,
}

impl ServerConfig {
    /// Create a server configuration from the node identity.
    pub fn new(node_id: NodeId, identity: IdentitySecret) -> Self {
        Self {
            node_id,
            iat_mode: IatMode::default(),
            identity,
            replay: Arc::new(Mutex::new(ReplayFilter::new())),
        }
    }

    /// Set the write-timing obfuscation policy.
    pub fn with_iat_mode(mut self, mode: IatMode) -> Self {
        self.iat_mode = mode;
        self
    }

    /// The public half of the identity key, for distribution to clients.
    pub fn identity_public(&self) -> PublicKey {
        PublicKey::from(&self.identity)
    }

    pub(crate) fn identity(&self) -> &IdentitySecret {
        &self.identity
    }

    pub(crate) fn replay_filter(&self) -> &Mutex<ReplayFilter> {
        &self.replay
    }
}
