//! Connection state machine.
//!
//! A [`Connection`] wraps a carrier byte pipe, drives the handshake once at
//! construction, and then pumps packets in both directions. The error model
//! is fail-closed: the first fatal error latches the broken state and every
//! later operation reports [`Error::InvalidState`].
//!
//! The tx path (encoder, frame counter, padding sampling, carrier write
//! half) and the rx path (decoder, frame counter, reassembly and decoded
//! buffers, carrier read half) are independent half-domains; [`split`]
//! separates them so one task can sit in `read` while another writes. The
//! only state they share is the broken latch and the outbound length
//! distribution, which the rx path swaps when the server rotates the
//! padding seed.
//!
//! [`split`]: Connection::split

use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::framing::{Decoder, Encoder, MAX_FRAME_LENGTH, MAX_FRAME_PAYLOAD};
use crate::handshake;
use crate::obfuscation::{IatMode, IatShaper, LenDist, Seed};
use crate::packet::{
    self, PacketType, CONSUME_READ_SIZE, MAX_PACKET_PAYLOAD, SEED_PAYLOAD_LENGTH,
};
use crate::{ClientConfig, Role, ServerConfig};

/// Connection lifecycle state. Broken is terminal and covers local close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Broken,
}

/// The write half-domain: encoder, padding sampler, timing shaper.
struct TxState {
    encoder: Encoder,
    dist: LenDist,
    iat: IatShaper,
}

/// The read half-domain: decoder, reassembly buffer, decoded-payload
/// buffer, and the shared distribution handle it resets on seed rotation.
struct RxState {
    decoder: Decoder,
    recv_buf: BytesMut,
    decoded: BytesMut,
    dist: LenDist,
    role: Role,
    /// Latched by the first fatal rx error, even when buffered payload is
    /// still being drained to the caller.
    poisoned: bool,
}

impl TxState {
    /// Seal one packet into a frame and write it to the carrier.
    ///
    /// A short write is fatal: the frame counter has already advanced past
    /// the partially delivered frame, so there is nothing to resume.
    async fn produce_packet<W>(
        &mut self,
        carrier: &mut W,
        ty: PacketType,
        data: &[u8],
        mut pad_len: usize,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if data.len() + pad_len > MAX_PACKET_PAYLOAD {
            debug_assert!(
                false,
                "packet payload {} + padding {} exceeds capacity",
                data.len(),
                pad_len
            );
            tracing::warn!(
                data = data.len(),
                padding = pad_len,
                "clamping oversized packet padding"
            );
            pad_len = MAX_PACKET_PAYLOAD - data.len();
        }

        let mut pkt = [0u8; MAX_FRAME_PAYLOAD];
        let pkt_len = packet::assemble(&mut pkt, ty, data, pad_len);

        let mut frame = [0u8; MAX_FRAME_LENGTH];
        let frame_len = self.encoder.encode(&mut frame, &pkt[..pkt_len])?;

        let written = carrier.write(&frame[..frame_len]).await?;
        if written < frame_len {
            return Err(Error::ShortWrite);
        }

        let delay = self.iat.sample_delay_us();
        if delay > 0 {
            tokio::time::sleep(Duration::from_micros(delay)).await;
        }
        Ok(())
    }

    /// Chunk `buf` into payload packets, one frame each.
    async fn write_payload<W>(&mut self, carrier: &mut W, buf: &[u8]) -> Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut sent = 0;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let take = match self.iat.mode() {
                // Paranoid shaping also samples the payload boundary, so
                // even the chunking of large writes follows the
                // distribution.
                IatMode::Paranoid => {
                    let sampled = cmp::min(self.dist.sample() as usize, MAX_PACKET_PAYLOAD);
                    cmp::min(remaining.len(), cmp::max(1, sampled))
                }
                _ => cmp::min(remaining.len(), MAX_PACKET_PAYLOAD),
            };
            let (chunk, rest) = remaining.split_at(take);

            let pad = cmp::min(self.dist.sample() as usize, MAX_PACKET_PAYLOAD - take);
            self.produce_packet(carrier, PacketType::Payload, chunk, pad)
                .await?;

            sent += take;
            remaining = rest;
        }
        Ok(sent)
    }

    /// Emit a prng-seed control packet.
    async fn send_seed<W>(&mut self, carrier: &mut W, seed: &Seed) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let pad = cmp::min(
            self.dist.sample() as usize,
            MAX_PACKET_PAYLOAD - SEED_PAYLOAD_LENGTH,
        );
        self.produce_packet(carrier, PacketType::PrngSeed, seed.as_bytes(), pad)
            .await
    }
}

impl RxState {
    /// Perform one carrier read, then drain every complete frame in the
    /// reassembly buffer, dispatching packets by type.
    ///
    /// Returns bytes delivered (to `sink`, or to the decoded buffer) and
    /// the terminal error, if any. A decoder or packet error takes
    /// precedence over the carrier's own error; the decoder asking for
    /// more data is not an error at all.
    async fn consume<R, W>(&mut self, carrier: &mut R, mut sink: Option<&mut W>) -> (usize, Option<Error>)
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut delivered = 0usize;

        let mut chunk = [0u8; CONSUME_READ_SIZE];
        let mut carrier_err = match carrier.read(&mut chunk).await {
            Ok(0) => Some(Error::Carrier(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "carrier closed",
            ))),
            Ok(n) => {
                self.recv_buf.extend_from_slice(&chunk[..n]);
                None
            }
            Err(e) => Some(Error::Carrier(e)),
        };

        let mut fatal: Option<Error> = None;
        let mut frame = [0u8; MAX_FRAME_PAYLOAD];
        while !self.recv_buf.is_empty() {
            let frame_len = match self.decoder.decode(&mut frame, &mut self.recv_buf) {
                Err(Error::Again) => break,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
                Ok(n) => n,
            };

            let (ty, payload) = match packet::parse(&frame[..frame_len]) {
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
                Ok(parsed) => parsed,
            };

            match PacketType::from_wire(ty) {
                Some(PacketType::Payload) => {
                    if payload.is_empty() {
                        continue;
                    }
                    match sink.as_mut() {
                        // write_to() streams payload straight into the sink.
                        Some(w) => match w.write(payload).await {
                            Ok(n) => {
                                delivered += n;
                                if n < payload.len() {
                                    fatal = Some(Error::ShortWrite);
                                    break;
                                }
                            }
                            Err(e) => {
                                fatal = Some(Error::Carrier(e));
                                break;
                            }
                        },
                        // read() stashes payload in the decoded buffer.
                        None => {
                            self.decoded.extend_from_slice(payload);
                            delivered += payload.len();
                        }
                    }
                }
                Some(PacketType::PrngSeed) => {
                    // Only the client adopts a new outbound distribution.
                    if self.role == Role::Client && payload.len() == SEED_PAYLOAD_LENGTH {
                        if let Some(seed) = Seed::from_slice(payload) {
                            self.dist.reset(&seed);
                            tracing::debug!("outbound length distribution reseeded by peer");
                        }
                    }
                }
                // Unrecognised packet types are discarded; the frame
                // counter has already advanced.
                None => {}
            }
        }

        if fatal.is_some() || carrier_err.is_some() {
            let err = fatal.or_else(|| carrier_err.take()).expect("one is set");
            self.poisoned = true;
            return (delivered, Some(err));
        }
        (delivered, None)
    }

    /// Serve `out` from the decoded buffer, pulling frames off the carrier
    /// until payload is available.
    async fn read_into<R>(&mut self, carrier: &mut R, out: &mut [u8]) -> Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        while self.decoded.is_empty() {
            let (_, err) = self
                .consume::<R, tokio::io::Sink>(carrier, None)
                .await;
            if let Some(e) = err {
                if self.decoded.is_empty() {
                    return Err(e);
                }
                // Payload decoded before the failure still reaches the
                // caller once; the connection is already poisoned.
                tracing::debug!(error = %e, "draining decoded payload from broken connection");
                break;
            }
        }

        let n = cmp::min(out.len(), self.decoded.len());
        out[..n].copy_from_slice(&self.decoded[..n]);
        self.decoded.advance(n);
        Ok(n)
    }

    /// Stream decoded payload into `sink` until the connection terminates.
    /// Clean carrier EOF ends the stream without an error.
    async fn copy_to<R, W>(&mut self, carrier: &mut R, sink: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;

        // Payload buffered by earlier read() calls goes first.
        if !self.decoded.is_empty() {
            let buffered = self.decoded.split();
            let n = match sink.write(&buffered).await {
                Ok(n) => n,
                Err(e) => {
                    self.poisoned = true;
                    return Err(Error::Carrier(e));
                }
            };
            total += n as u64;
            if n < buffered.len() {
                self.poisoned = true;
                return Err(Error::ShortWrite);
            }
        }

        loop {
            let (n, err) = self.consume(carrier, Some(&mut *sink)).await;
            total += n as u64;
            if let Some(e) = err {
                return match e {
                    Error::Carrier(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                        Ok(total)
                    }
                    other => Err(other),
                };
            }
        }
    }
}

/// State shared between split halves: the broken latch.
struct Shared {
    broken: AtomicBool,
}

/// An established transport connection over a carrier byte pipe.
pub struct Connection<T> {
    carrier: T,
    role: Role,
    state: State,
    tx: TxState,
    rx: RxState,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Establish a connection as the client: drive the handshake over the
    /// carrier and return the open connection.
    pub async fn connect(mut carrier: T, config: &ClientConfig) -> Result<Self> {
        let outcome = handshake::client(&mut carrier, config).await?;
        Ok(Self::from_session(
            carrier,
            Role::Client,
            outcome,
            config.iat_mode,
        ))
    }

    /// Establish a connection as the server, answering a client handshake.
    pub async fn accept(mut carrier: T, config: &ServerConfig) -> Result<Self> {
        let outcome = handshake::server(&mut carrier, config).await?;
        Ok(Self::from_session(
            carrier,
            Role::Server,
            outcome,
            config.iat_mode,
        ))
    }

    fn from_session(
        carrier: T,
        role: Role,
        outcome: handshake::Outcome,
        iat_mode: IatMode,
    ) -> Self {
        let keys = outcome.keys;
        let dist = LenDist::new(&Seed::from_bytes(*keys.len_seed()));

        let tx = TxState {
            encoder: Encoder::new(keys.tx()),
            dist: dist.clone(),
            iat: IatShaper::new(iat_mode, keys.len_seed()),
        };
        let rx = RxState {
            decoder: Decoder::new(keys.rx()),
            // Carrier bytes that trailed the handshake are already frames.
            recv_buf: outcome.leftover,
            decoded: BytesMut::new(),
            dist: dist.clone(),
            role,
            poisoned: false,
        };

        Self {
            carrier,
            role,
            state: State::Open,
            tx,
            rx,
        }
    }

    /// Which side of the connection this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True while the connection can read and write.
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Number of frames sent so far.
    pub fn tx_frames(&self) -> u64 {
        self.tx.encoder.frames()
    }

    /// Number of frames received and decoded so far.
    pub fn rx_frames(&self) -> u64 {
        self.rx.decoder.frames()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == State::Open {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    /// Latch the broken state for a fatal error and hand the error back.
    fn fatal(&mut self, err: Error) -> Error {
        if err.is_fatal() && self.state == State::Open {
            self.state = State::Broken;
            tracing::debug!(error = %err, "connection broken");
        }
        err
    }

    fn sync_rx_state(&mut self) {
        if self.rx.poisoned && self.state == State::Open {
            self.state = State::Broken;
            tracing::debug!("connection broken by receive path");
        }
    }

    /// Write application bytes, chunking into padded payload packets.
    ///
    /// An empty `buf` is legal and emits nothing. Returns the number of
    /// payload bytes accepted, which on success is all of them.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        match self.tx.write_payload(&mut self.carrier, buf).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fatal(e)),
        }
    }

    /// Read decoded application bytes into `buf`.
    ///
    /// Serves buffered payload immediately; otherwise blocks on the
    /// carrier until a payload-bearing frame arrives.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let result = self.rx.read_into(&mut self.carrier, buf).await;
        self.sync_rx_state();
        result
    }

    /// Stream decoded payload into `sink`, bypassing the decoded buffer.
    ///
    /// Runs until the connection terminates; clean carrier EOF returns the
    /// total bytes forwarded, anything else surfaces as the terminal error.
    pub async fn write_to<W>(&mut self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.ensure_open()?;
        let result = self.rx.copy_to(&mut self.carrier, sink).await;
        self.sync_rx_state();
        result
    }

    /// Emit a prng-seed control packet carrying a fresh padding seed.
    ///
    /// Server only: clients have no authority over the peer's padding and
    /// get [`Error::InvalidState`] without touching the wire.
    pub async fn rotate_seed(&mut self, seed: &Seed) -> Result<()> {
        self.ensure_open()?;
        if self.role != Role::Server {
            return Err(Error::InvalidState);
        }
        match self.tx.send_seed(&mut self.carrier, seed).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fatal(e)),
        }
    }

    /// Shut the carrier down. The connection is terminal afterwards.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.carrier.shutdown().await;
        self.state = State::Broken;
        result.map_err(Error::Carrier)
    }

    /// Split into independently owned read and write halves.
    ///
    /// The halves share the broken latch: a fatal error on either side
    /// poisons both.
    pub fn split(self) -> (ReadHalf<T>, WriteHalf<T>) {
        let shared = Arc::new(Shared {
            broken: AtomicBool::new(self.state != State::Open),
        });
        let (read, write) = tokio::io::split(self.carrier);
        (
            ReadHalf {
                carrier: read,
                rx: self.rx,
                shared: Arc::clone(&shared),
            },
            WriteHalf {
                carrier: write,
                tx: self.tx,
                role: self.role,
                shared,
            },
        )
    }
}

/// The receive half of a split [`Connection`].
pub struct ReadHalf<T> {
    carrier: tokio::io::ReadHalf<T>,
    rx: RxState,
    shared: Arc<Shared>,
}

impl<T> ReadHalf<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// As [`Connection::read`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let result = self.rx.read_into(&mut self.carrier, buf).await;
        self.sync_state();
        result
    }

    /// As [`Connection::write_to`].
    pub async fn write_to<W>(&mut self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.ensure_open()?;
        let result = self.rx.copy_to(&mut self.carrier, sink).await;
        self.sync_state();
        result
    }

    /// Number of frames received and decoded so far.
    pub fn rx_frames(&self) -> u64 {
        self.rx.decoder.frames()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.broken.load(Ordering::Acquire) {
            Err(Error::InvalidState)
        } else {
            Ok(())
        }
    }

    fn sync_state(&self) {
        if self.rx.poisoned {
            self.shared.broken.store(true, Ordering::Release);
        }
    }
}

/// The transmit half of a split [`Connection`].
pub struct WriteHalf<T> {
    carrier: tokio::io::WriteHalf<T>,
    tx: TxState,
    role: Role,
    shared: Arc<Shared>,
}

impl<T> WriteHalf<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// As [`Connection::write`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        match self.tx.write_payload(&mut self.carrier, buf).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fatal(e)),
        }
    }

    /// As [`Connection::rotate_seed`].
    pub async fn rotate_seed(&mut self, seed: &Seed) -> Result<()> {
        self.ensure_open()?;
        if self.role != Role::Server {
            return Err(Error::InvalidState);
        }
        match self.tx.send_seed(&mut self.carrier, seed).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fatal(e)),
        }
    }

    /// As [`Connection::close`].
    pub async fn close(&mut self) -> Result<()> {
        let result = self.carrier.shutdown().await;
        self.shared.broken.store(true, Ordering::Release);
        result.map_err(Error::Carrier)
    }

    /// Number of frames sent so far.
    pub fn tx_frames(&self) -> u64 {
        self.tx.encoder.frames()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.broken.load(Ordering::Acquire) {
            Err(Error::InvalidState)
        } else {
            Ok(())
        }
    }

    fn fatal(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.shared.broken.store(true, Ordering::Release);
            tracing::debug!(error = %err, "connection broken");
        }
        err
    }
}
