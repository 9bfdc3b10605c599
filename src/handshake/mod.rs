//! Connection establishment.
//!
//! Handshake messages travel raw over the carrier before AEAD framing
//! begins, so they must already look like noise. Each message is an X25519
//! public key, optional payload, random padding of distribution-sampled
//! length, and a trailing mark + MAC:
//!
//! ```text
//!     client hello:  X (32) | padding | mark (16) | mac (16)
//!     server hello:  Y (32) | AUTH (32) | padding | mark (16) | mac (16)
//! ```
//!
//! The mark is a truncated HMAC of the public key under a key derived from
//! the server's identity key and node identifier, letting the receiver find
//! the end of the variable-length padding without any cleartext framing.
//! The MAC covers the whole message plus the hour epoch, which bounds the
//! window in which a recorded hello stays valid; the server additionally
//! remembers accepted MACs and rejects replays outright.

mod ntor;
mod replay;

pub use replay::ReplayFilter;

use bytes::BytesMut;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand_core::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{NodeId, PublicKey, SessionKeys, SessionSecret};
use crate::error::{Error, Result};
use crate::obfuscation::{LenDist, Seed};
use crate::{ClientConfig, Role, ServerConfig};

/// Length of the padding-terminating mark in bytes.
pub(crate) const MARK_LENGTH: usize = 16;

/// Length of the message MAC in bytes.
pub(crate) const MAC_LENGTH: usize = 16;

/// Fixed bytes of a client hello before the padding.
const CLIENT_FIXED_LENGTH: usize = 32;

/// Fixed bytes of a server hello before the padding.
const SERVER_FIXED_LENGTH: usize = 32 + ntor::AUTH_LENGTH;

/// Hard cap on the size of a single handshake message.
const MAX_HANDSHAKE_LENGTH: usize = 8192;

/// Carrier read granularity while waiting for a handshake message.
const READ_CHUNK: usize = 2048;

/// What a completed handshake hands to the connection.
pub(crate) struct Outcome {
    /// Derived frame keys and padding seeds.
    pub keys: SessionKeys,
    /// Carrier bytes that arrived after the peer's handshake message;
    /// already framed traffic, preloaded into the reassembly buffer.
    pub leftover: BytesMut,
}

/// Drive the client side of the handshake.
pub(crate) async fn client<T>(carrier: &mut T, config: &ClientConfig) -> Result<Outcome>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let session = SessionSecret::random();
    let x_public = PublicKey::from(&session);
    let key = mac_key(&config.server_public, &config.node_id);
    let startup = LenDist::new(&Seed::derive(&config.node_id));

    let hello = build_client_hello(&x_public, &key, startup.sample() as usize, epoch_hours());
    carrier.write_all(&hello).await?;
    carrier.flush().await?;

    let mut buf = BytesMut::with_capacity(MAX_HANDSHAKE_LENGTH);
    let (mark_pos, _) = read_and_verify(carrier, &mut buf, &key, SERVER_FIXED_LENGTH).await?;

    let y_public = PublicKey::from_slice(&buf[..32])
        .ok_or_else(|| Error::handshake("malformed server public key"))?;
    let auth: [u8; ntor::AUTH_LENGTH] = buf[32..SERVER_FIXED_LENGTH].try_into().unwrap();

    let material = ntor::client_finish(
        &session,
        &config.node_id,
        &config.server_public,
        &y_public,
        &auth,
    )?;

    let leftover = buf.split_off(mark_pos + MARK_LENGTH + MAC_LENGTH);
    tracing::debug!("client handshake complete");

    Ok(Outcome {
        keys: SessionKeys::derive(&material, Role::Client),
        leftover,
    })
}

/// Drive the server side of the handshake.
pub(crate) async fn server<T>(carrier: &mut T, config: &ServerConfig) -> Result<Outcome>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let identity_public = PublicKey::from(config.identity());
    let key = mac_key(&identity_public, &config.node_id);
    let startup = LenDist::new(&Seed::derive(&config.node_id));

    let mut buf = BytesMut::with_capacity(MAX_HANDSHAKE_LENGTH);
    let (mark_pos, epoch) = read_and_verify(carrier, &mut buf, &key, CLIENT_FIXED_LENGTH).await?;

    let mac_bytes: [u8; MAC_LENGTH] = buf[mark_pos + MARK_LENGTH..mark_pos + MARK_LENGTH + MAC_LENGTH]
        .try_into()
        .unwrap();
    if !config.replay_filter().lock().test_and_set(epoch, &mac_bytes) {
        tracing::warn!("rejected replayed client hello");
        return Err(Error::Replay);
    }

    let x_public = PublicKey::from_slice(&buf[..32])
        .ok_or_else(|| Error::handshake("malformed client public key"))?;
    let leftover = buf.split_off(mark_pos + MARK_LENGTH + MAC_LENGTH);

    let reply = ntor::server_respond(config.identity(), &config.node_id, &x_public)?;
    let hello = build_server_hello(
        &reply.session_public,
        &reply.auth,
        &key,
        startup.sample() as usize,
        epoch_hours(),
    );
    carrier.write_all(&hello).await?;
    carrier.flush().await?;
    tracing::debug!("server handshake complete");

    Ok(Outcome {
        keys: SessionKeys::derive(&reply.material, Role::Server),
        leftover,
    })
}

/// Assemble a client hello.
fn build_client_hello(
    x_public: &PublicKey,
    mac_key: &[u8],
    pad_len: usize,
    epoch: u64,
) -> BytesMut {
    let mut msg = BytesMut::with_capacity(CLIENT_FIXED_LENGTH + pad_len + MARK_LENGTH + MAC_LENGTH);
    msg.extend_from_slice(x_public.as_bytes());
    extend_random(&mut msg, pad_len);
    msg.extend_from_slice(&mark(mac_key, x_public.as_bytes()));
    let mac = message_mac(mac_key, &msg, epoch);
    msg.extend_from_slice(&mac);
    msg
}

/// Assemble a server hello.
fn build_server_hello(
    y_public: &PublicKey,
    auth: &[u8; ntor::AUTH_LENGTH],
    mac_key: &[u8],
    pad_len: usize,
    epoch: u64,
) -> BytesMut {
    let mut msg = BytesMut::with_capacity(SERVER_FIXED_LENGTH + pad_len + MARK_LENGTH + MAC_LENGTH);
    msg.extend_from_slice(y_public.as_bytes());
    msg.extend_from_slice(auth);
    extend_random(&mut msg, pad_len);
    msg.extend_from_slice(&mark(mac_key, y_public.as_bytes()));
    let mac = message_mac(mac_key, &msg, epoch);
    msg.extend_from_slice(&mac);
    msg
}

/// Accumulate carrier bytes until a complete, authentic handshake message
/// is present in `buf`.
///
/// Returns the mark position and the epoch the MAC verified under. Bytes
/// beyond the MAC are left in `buf` untouched.
async fn read_and_verify<T>(
    carrier: &mut T,
    buf: &mut BytesMut,
    mac_key: &[u8],
    fixed_len: usize,
) -> Result<(usize, u64)>
where
    T: AsyncRead + Unpin,
{
    loop {
        if buf.len() >= fixed_len + MARK_LENGTH + MAC_LENGTH {
            let repr: [u8; 32] = buf[..32].try_into().unwrap();
            let expected_mark = mark(mac_key, &repr);

            if let Some(pos) = find(&buf[fixed_len..], &expected_mark) {
                let mark_pos = fixed_len + pos;
                if buf.len() >= mark_pos + MARK_LENGTH + MAC_LENGTH {
                    let received =
                        &buf[mark_pos + MARK_LENGTH..mark_pos + MARK_LENGTH + MAC_LENGTH];
                    let now = epoch_hours();
                    let mut verified = None;
                    for epoch in [now, now.saturating_sub(1), now + 1] {
                        let expected = message_mac(mac_key, &buf[..mark_pos + MARK_LENGTH], epoch);
                        if bool::from(expected[..].ct_eq(received)) {
                            verified = Some(epoch);
                            break;
                        }
                    }
                    return match verified {
                        Some(epoch) => Ok((mark_pos, epoch)),
                        None => Err(Error::handshake("message authentication failed")),
                    };
                }
            }
        }

        if buf.len() >= MAX_HANDSHAKE_LENGTH {
            return Err(Error::handshake("peer message exceeds size limit"));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = carrier.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::handshake("carrier closed during handshake"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Derive the MAC key shared by both peers: identity public key followed by
/// the node identifier. Public material only; the handshake runs before any
/// secret is agreed.
fn mac_key(identity_public: &PublicKey, node_id: &NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 20);
    key.extend_from_slice(identity_public.as_bytes());
    key.extend_from_slice(node_id.as_bytes());
    key
}

/// Truncated HMAC marking the end of a message's padding.
fn mark(mac_key: &[u8], repr: &[u8; 32]) -> [u8; MARK_LENGTH] {
    let mut mac = Hmac::<Sha256>::new_from_slice(mac_key).expect("HMAC can take key of any size");
    mac.update(repr);
    let digest = mac.finalize().into_bytes();
    digest[..MARK_LENGTH].try_into().unwrap()
}

/// Truncated HMAC over a whole message and the hour epoch.
fn message_mac(mac_key: &[u8], msg: &[u8], epoch_hours: u64) -> [u8; MAC_LENGTH] {
    let mut mac = Hmac::<Sha256>::new_from_slice(mac_key).expect("HMAC can take key of any size");
    mac.update(msg);
    mac.update(&epoch_hours.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    digest[..MAC_LENGTH].try_into().unwrap()
}

/// Hours since the Unix epoch.
fn epoch_hours() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 3600
}

/// Append `len` random bytes to `buf`.
fn extend_random(buf: &mut BytesMut, len: usize) {
    let mut padding = vec![0u8; len];
    OsRng.fill_bytes(&mut padding);
    buf.extend_from_slice(&padding);
}

fn find(haystack: &[u8], needle: &[u8; MARK_LENGTH]) -> Option<usize> {
    haystack
        .windows(MARK_LENGTH)
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentitySecret;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn configs() -> (ClientConfig, ServerConfig) {
        let identity = IdentitySecret::random();
        let node_id = NodeId::from_bytes([0x29u8; 20]);
        let client = ClientConfig::new(node_id, PublicKey::from(&identity));
        let server = ServerConfig::new(node_id, identity);
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake_derives_mirrored_keys() {
        let (client_cfg, server_cfg) = configs();
        let (mut a, mut b) = tokio::io::duplex(1 << 16);

        let (client_out, server_out) = tokio::join!(
            client(&mut a, &client_cfg),
            server(&mut b, &server_cfg),
        );
        let client_out = client_out.unwrap();
        let server_out = server_out.unwrap();

        assert_eq!(
            client_out.keys.tx().key_bytes(),
            server_out.keys.rx().key_bytes()
        );
        assert_eq!(
            client_out.keys.rx().key_bytes(),
            server_out.keys.tx().key_bytes()
        );
        assert_eq!(client_out.keys.len_seed(), server_out.keys.peer_len_seed());
        assert!(client_out.leftover.is_empty());
        assert!(server_out.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_hello_rejected() {
        let (client_cfg, server_cfg) = configs();
        let key = mac_key(&client_cfg.server_public, &client_cfg.node_id);

        let session = SessionSecret::random();
        let x_public = PublicKey::from(&session);
        let hello = build_client_hello(&x_public, &key, 171, epoch_hours());

        // First sight is accepted and answered.
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        a.write_all(&hello).await.unwrap();
        server(&mut b, &server_cfg).await.unwrap();

        // The identical bytes replayed on a fresh carrier are rejected.
        let (mut a2, mut b2) = tokio::io::duplex(1 << 16);
        a2.write_all(&hello).await.unwrap();
        let result = server(&mut b2, &server_cfg).await;
        assert!(matches!(result, Err(Error::Replay)));
    }

    #[tokio::test]
    async fn test_wrong_node_id_rejected() {
        let (_, server_cfg) = configs();
        let identity_public = PublicKey::from(server_cfg.identity());
        let wrong_key = mac_key(&identity_public, &NodeId::from_bytes([0x77u8; 20]));

        let session = SessionSecret::random();
        let x_public = PublicKey::from(&session);
        let hello = build_client_hello(&x_public, &wrong_key, 64, epoch_hours());

        // The server cannot locate the mark under its own MAC key; it keeps
        // reading until the carrier closes, then gives up.
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        a.write_all(&hello).await.unwrap();
        drop(a);
        assert!(matches!(
            server(&mut b, &server_cfg).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_trailing_bytes_survive_as_leftover() {
        let (client_cfg, server_cfg) = configs();
        let key = mac_key(&client_cfg.server_public, &client_cfg.node_id);

        let session = SessionSecret::random();
        let x_public = PublicKey::from(&session);
        let mut hello = build_client_hello(&x_public, &key, 64, epoch_hours());
        hello.extend_from_slice(b"framed traffic follows immediately");

        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        a.write_all(&hello).await.unwrap();
        let outcome = server(&mut b, &server_cfg).await.unwrap();

        assert_eq!(&outcome.leftover[..], b"framed traffic follows immediately");
    }

    #[test]
    fn test_hello_layout() {
        let identity = IdentitySecret::random();
        let node_id = NodeId::from_bytes([0x01u8; 20]);
        let key = mac_key(&PublicKey::from(&identity), &node_id);

        let session = SessionSecret::random();
        let x_public = PublicKey::from(&session);

        let pad_len = 200;
        let hello = build_client_hello(&x_public, &key, pad_len, 12345);
        assert_eq!(
            hello.len(),
            CLIENT_FIXED_LENGTH + pad_len + MARK_LENGTH + MAC_LENGTH
        );
        assert_eq!(&hello[..32], x_public.as_bytes());

        let mark_pos = CLIENT_FIXED_LENGTH + pad_len;
        assert_eq!(
            &hello[mark_pos..mark_pos + MARK_LENGTH],
            &mark(&key, x_public.as_bytes())
        );
    }

    #[test]
    fn test_filter_shared_across_connections() {
        let filter = Arc::new(Mutex::new(ReplayFilter::new()));
        assert!(filter.lock().test_and_set(1, &[0xaa; MAC_LENGTH]));
        assert!(!filter.lock().test_and_set(1, &[0xaa; MAC_LENGTH]));
    }
}
