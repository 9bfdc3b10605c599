//! ntor-style one-way authenticated key exchange.
//!
//! The client proves nothing; the server proves possession of its identity
//! key. Both sides mix two X25519 exchanges (client session key against the
//! server's session and identity keys) with the public transcript into a
//! keying seed, and the server returns an AUTH tag binding the exchange.
//!
//! Tag constants follow the ntor construction: `H(x, t)` is HMAC-SHA256
//! keyed by the tag `t` over the message `x`.

use subtle::ConstantTimeEq;

use crate::crypto::{
    hmac_sha256, IdentitySecret, KeyMaterial, NodeId, PublicKey, SessionSecret,
};
use crate::error::{Error, Result};

/// Protocol identifier mixed into every transcript hash.
pub(crate) const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";

const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// Length of the server's AUTH tag in bytes.
pub(crate) const AUTH_LENGTH: usize = 32;

/// Server side of a completed exchange.
pub(crate) struct ServerReply {
    pub material: KeyMaterial,
    /// The server's per-connection public key (Y).
    pub session_public: PublicKey,
    pub auth: [u8; AUTH_LENGTH],
}

/// Complete the exchange on the server, given the client's public key.
///
/// Generates the server's session keypair internally.
pub(crate) fn server_respond(
    identity: &IdentitySecret,
    node_id: &NodeId,
    client_public: &PublicKey,
) -> Result<ServerReply> {
    let session = SessionSecret::random();
    let session_public = PublicKey::from(&session);
    let identity_public = PublicKey::from(identity);

    // EXP(X, y) and EXP(X, b)
    let dh_session = session.diffie_hellman(client_public);
    let dh_identity = identity.diffie_hellman(client_public);

    let (material, auth) = derive(
        dh_session.as_bytes(),
        dh_identity.as_bytes(),
        node_id,
        &identity_public,
        client_public,
        &session_public,
    )?;

    Ok(ServerReply {
        material,
        session_public,
        auth,
    })
}

/// Complete the exchange on the client and verify the server's AUTH tag.
pub(crate) fn client_finish(
    session: &SessionSecret,
    node_id: &NodeId,
    identity_public: &PublicKey,
    server_public: &PublicKey,
    auth: &[u8; AUTH_LENGTH],
) -> Result<KeyMaterial> {
    let client_public = PublicKey::from(session);

    // EXP(Y, x) and EXP(B, x)
    let dh_session = session.diffie_hellman(server_public);
    let dh_identity = session.diffie_hellman(identity_public);

    let (material, expected) = derive(
        dh_session.as_bytes(),
        dh_identity.as_bytes(),
        node_id,
        identity_public,
        &client_public,
        server_public,
    )?;

    if !bool::from(expected[..].ct_eq(&auth[..])) {
        return Err(Error::handshake("server authentication failed"));
    }

    Ok(material)
}

/// Condense the transcript into keying material and the AUTH tag.
fn derive(
    dh_session: &[u8; 32],
    dh_identity: &[u8; 32],
    node_id: &NodeId,
    identity_public: &PublicKey,
    client_public: &PublicKey,
    server_public: &PublicKey,
) -> Result<(KeyMaterial, [u8; AUTH_LENGTH])> {
    // secret_input = EXP | EXP' | ID | B | X | Y | PROTOID
    let mut secret_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len());
    secret_input.extend_from_slice(dh_session);
    secret_input.extend_from_slice(dh_identity);
    secret_input.extend_from_slice(node_id.as_bytes());
    secret_input.extend_from_slice(identity_public.as_bytes());
    secret_input.extend_from_slice(client_public.as_bytes());
    secret_input.extend_from_slice(server_public.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = hmac_sha256(T_KEY, &secret_input);
    let verify = hmac_sha256(T_VERIFY, &secret_input);

    // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
    let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(node_id.as_bytes());
    auth_input.extend_from_slice(identity_public.as_bytes());
    auth_input.extend_from_slice(server_public.as_bytes());
    auth_input.extend_from_slice(client_public.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");

    let auth = hmac_sha256(T_MAC, &auth_input);
    let material = KeyMaterial::expand_from(&key_seed, PROTOID)?;

    Ok((material, auth))
}
