//! X25519 key exchange primitives and node identity.
//!
//! Provides type-safe wrappers around X25519 operations with automatic
//! zeroization of secret material on drop.

use x25519_dalek::{
    PublicKey as DalekPublic, SharedSecret as DalekShared, StaticSecret as DalekStatic,
};
use zeroize::ZeroizeOnDrop;

use crate::crypto::{NODE_ID_LENGTH, PUBLIC_KEY_LENGTH};

/// Opaque 20-byte identifier of a server node.
///
/// Public; distributed alongside the server's identity public key and mixed
/// into the handshake transcript and the startup padding distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, if it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; NODE_ID_LENGTH] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get the raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A long-lived X25519 secret key identifying a server.
///
/// Persisted across connections; should be stored securely.
/// Automatically zeroized when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentitySecret(DalekStatic);

impl IdentitySecret {
    /// Generate a new random identity secret.
    pub fn random() -> Self {
        Self(DalekStatic::random_from_rng(rand::thread_rng()))
    }

    /// Create from raw bytes.
    ///
    /// # Security
    ///
    /// The input bytes should come from a cryptographically secure source.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(DalekStatic::from(bytes))
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        SharedSecret(self.0.diffie_hellman(&their_public.0))
    }

    /// Export the secret key bytes.
    ///
    /// # Security
    ///
    /// Handle the returned bytes with care and zeroize when done.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<&IdentitySecret> for PublicKey {
    fn from(secret: &IdentitySecret) -> Self {
        PublicKey(DalekPublic::from(&secret.0))
    }
}

/// A per-connection X25519 secret key.
///
/// Generated fresh for each handshake and discarded afterwards; provides
/// forward secrecy. Backed by a reusable secret because the handshake
/// performs two Diffie-Hellman operations with the same key.
/// Automatically zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct SessionSecret(DalekStatic);

impl SessionSecret {
    /// Generate a new random session secret.
    pub fn random() -> Self {
        Self(DalekStatic::random_from_rng(rand::thread_rng()))
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        SharedSecret(self.0.diffie_hellman(&their_public.0))
    }
}

impl From<&SessionSecret> for PublicKey {
    fn from(secret: &SessionSecret) -> Self {
        PublicKey(DalekPublic::from(&secret.0))
    }
}

/// An X25519 public key.
///
/// Safe to share publicly. Used for key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(DalekPublic);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(DalekPublic::from(bytes))
    }

    /// Create from a slice, if it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().ok()?;
        Some(Self(DalekPublic::from(arr)))
    }

    /// Get the raw bytes of this public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.0.as_bytes()
    }

    /// Convert to raw bytes.
    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// The result of an X25519 Diffie-Hellman key exchange.
///
/// Fed into the handshake transcript; never used as a key directly.
/// Automatically zeroized when dropped.
pub struct SharedSecret(DalekShared);

impl SharedSecret {
    /// Get the raw shared secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_exchange() {
        let alice = SessionSecret::random();
        let alice_public = PublicKey::from(&alice);

        let bob = SessionSecret::random();
        let bob_public = PublicKey::from(&bob);

        let alice_shared = alice.diffie_hellman(&bob_public);
        let bob_shared = bob.diffie_hellman(&alice_public);

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_identity_key_exchange() {
        let server_identity = IdentitySecret::random();
        let server_public = PublicKey::from(&server_identity);

        let client_session = SessionSecret::random();
        let client_public = PublicKey::from(&client_session);

        let client_shared = client_session.diffie_hellman(&server_public);
        let server_shared = server_identity.diffie_hellman(&client_public);

        assert_eq!(client_shared.as_bytes(), server_shared.as_bytes());
    }

    #[test]
    fn test_identity_secret_roundtrip() {
        let secret1 = IdentitySecret::random();
        let secret2 = IdentitySecret::from_bytes(secret1.to_bytes());

        assert_eq!(PublicKey::from(&secret1), PublicKey::from(&secret2));
    }

    #[test]
    fn test_node_id_from_slice() {
        assert!(NodeId::from_slice(&[0u8; 19]).is_none());
        assert!(NodeId::from_slice(&[0u8; 21]).is_none());

        let id = NodeId::from_slice(&[0x42u8; 20]).unwrap();
        assert_eq!(id.as_bytes(), &[0x42u8; 20]);
    }
}
