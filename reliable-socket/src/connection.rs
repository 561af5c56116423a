//! Per-connection state and the stop-and-wait transfer engine.
//!
//! A [`Connection`] owns the complete state for one peer-to-peer session:
//! the FSM ([`crate::state`]), both sequence counters ([`crate::sender`],
//! [`crate::receiver`]), the RTO estimate ([`crate::timer`]) and the
//! datagram channel itself.  Every operation takes `&mut self`, so the type
//! system enforces that send / receive / close never run concurrently on
//! one connection.
//!
//! Handshake lives in [`crate::handshake`], teardown in
//! [`crate::teardown`]; both are built on the send-and-wait primitive
//! [`Connection::exchange`] defined here.
//!
//! ```text
//!   transmit ──▶ wait(deadline) ──reply──▶ classify ─┬─ Accept    → sample RTT, done
//!      ▲              │                              ├─ Interrupt → done, no sample
//!      │           timeout                           ├─ Respond   → answer, same deadline
//!      └── back off ◀─┘                              └─ Discard   → same deadline
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::packet::{Segment, SegmentType, MAX_PAYLOAD, MAX_SEGMENT_SIZE};
use crate::receiver::{Delivery, Receiver};
use crate::sender::Sender;
use crate::socket::DatagramChannel;
use crate::state::{CloseOrigin, ConnectionState, Role};
use crate::timer::{RtoEstimator, TimerConfig};

/// Public operation names, used to give errors and log lines context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Listen,
    Connect,
    Send,
    Receive,
    Close,
}

impl Operation {
    /// Short log tag for the component that runs this operation.
    pub(crate) fn tag(self) -> &'static str {
        match self {
            Self::Listen | Self::Connect => "hs",
            Self::Send | Self::Receive => "saw",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listen => "listen",
            Self::Connect => "connect",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// Errors surfaced to the application.
///
/// Timeouts and unexpected segments never appear here; they are absorbed by
/// retransmission and discarding.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The channel failed with something other than a timeout.  The
    /// connection has been released and is `Closed`.
    #[error("{op} failed: transport error: {source}")]
    Transport {
        op: Operation,
        #[source]
        source: io::Error,
    },
    /// Operation not allowed in the current state; nothing was sent.
    #[error("cannot {op} while connection is {state}")]
    InvalidState {
        op: Operation,
        state: ConnectionState,
    },
    #[error("payload of {len} bytes exceeds the {max}-byte segment limit")]
    PayloadTooLarge { len: usize, max: usize },
    /// The peer started teardown while we were waiting for an ACK.
    #[error("{op} aborted: peer closed the connection")]
    PeerClosed { op: Operation },
    /// A configured retransmission bound was reached.
    #[error("{op} gave up after {attempts} transmissions without a reply")]
    RetransmitLimit { op: Operation, attempts: u32 },
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub timer: TimerConfig,
    /// Retransmissions allowed per handshake step or `send` before giving up.
    /// `None` retries until acknowledged.
    pub max_retransmits: Option<u32>,
    /// Retransmissions allowed for our CLOSE before releasing anyway.
    pub close_retransmits: u32,
    /// How long a closing side waits for the peer's own CLOSE once its CLOSE
    /// is acknowledged.
    pub peer_close_timeout: Duration,
    /// Lower bound for the time-wait interval (`2 × RTO` otherwise).
    pub min_time_wait: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            max_retransmits: None,
            close_retransmits: 6,
            peer_close_timeout: Duration::from_secs(30),
            min_time_wait: Duration::from_millis(500),
        }
    }
}

/// How a send-and-wait loop treats one reply.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// The awaited answer: record an RTT sample and stop.
    Accept,
    /// Stop waiting without treating the reply as a round trip.
    Interrupt,
    /// Send this segment back and keep waiting on the same deadline.
    Respond(Segment),
    Discard,
}

/// Answers for segments left over from an earlier phase.
///
/// A snapshot taken before a wait, so classifiers can consult it without
/// borrowing the connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Strays {
    initiator: bool,
    receiver: Receiver,
}

impl Strays {
    pub(crate) fn answer(&self, segment: &Segment) -> Verdict {
        match segment.kind {
            // Our handshake ACK was lost and the listener is still retrying.
            SegmentType::SynAck if self.initiator => Verdict::Respond(Segment::handshake_ack()),
            // The peer missed our ACK for data we already delivered.
            SegmentType::Data => match self.receiver.reack_for(segment.seq) {
                Some(ack) => Verdict::Respond(Segment::ack(ack)),
                None => Verdict::Discard,
            },
            _ => Verdict::Discard,
        }
    }
}

/// A reliable, ordered connection over a [`DatagramChannel`].
pub struct Connection<C> {
    pub(crate) channel: C,
    pub(crate) state: ConnectionState,
    pub(crate) role: Role,
    pub(crate) sender: Sender,
    pub(crate) receiver: Receiver,
    pub(crate) rto: RtoEstimator,
    pub(crate) config: ConnectionConfig,
    /// Sequence number of the peer's CLOSE once observed.
    pub(crate) peer_close_seq: Option<u32>,
    /// Receive buffer; one byte larger than any legal segment so oversized
    /// datagrams are detected instead of silently truncated.
    buf: Vec<u8>,
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("send_sequence", &self.sender.next_seq())
            .field("in_flight", &self.sender.in_flight())
            .field("expect_sequence", &self.receiver.expect_seq())
            .field("rto", &self.rto.current_rto())
            .finish()
    }
}

impl<C: DatagramChannel> Connection<C> {
    /// Wrap an open channel.  The connection starts in
    /// [`ConnectionState::Init`]; run [`Connection::accept`] or
    /// [`Connection::initiate`] next.
    pub fn new(mut channel: C, config: ConnectionConfig) -> Self {
        let rto = RtoEstimator::new(config.timer.clone());
        channel.set_receive_timeout(rto.current_rto());
        Self {
            channel,
            state: ConnectionState::Init,
            role: Role::Uninitialized,
            sender: Sender::new(),
            receiver: Receiver::new(),
            rto,
            config,
            peer_close_seq: None,
            buf: vec![0u8; MAX_SEGMENT_SIZE + 1],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Sequence number the next `send` will use.
    pub fn send_sequence(&self) -> u32 {
        self.sender.next_seq()
    }

    /// Sequence number the next `receive` will accept.
    pub fn expect_sequence(&self) -> u32 {
        self.receiver.expect_seq()
    }

    pub fn rto(&self) -> &RtoEstimator {
        &self.rto
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.channel.peer_addr()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Deliver `data` as one DATA segment and wait until the peer
    /// acknowledges it.
    ///
    /// Retransmits with exponential backoff on every timeout.  Returns only
    /// once the ACK arrived, or with an error; there is no partial success.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnError> {
        let op = Operation::Send;
        match self.state {
            ConnectionState::Established => {}
            state @ (ConnectionState::Init
            | ConnectionState::Handshaking
            | ConnectionState::Closing(_)
            | ConnectionState::Closed) => return Err(ConnError::InvalidState { op, state }),
        }
        if data.len() > MAX_PAYLOAD {
            return Err(ConnError::PayloadTooLarge {
                len: data.len(),
                max: MAX_PAYLOAD,
            });
        }

        let segment = self.sender.begin(data);
        let seq = segment.seq;

        let strays = self.strays();
        let limit = self.config.max_retransmits;
        let outcome = self
            .exchange(op, &segment, limit, |reply| match reply.kind {
                SegmentType::Ack if reply.acknowledges(seq) => Verdict::Accept,
                SegmentType::Close => Verdict::Interrupt,
                _ => strays.answer(reply),
            })
            .await;

        match outcome {
            Ok((reply, _)) if reply.kind == SegmentType::Close => {
                self.sender.abandon();
                self.on_peer_close(op, reply.seq).await?;
                Err(ConnError::PeerClosed { op })
            }
            Ok((_, transmissions)) => {
                self.sender.on_ack(seq);
                log::debug!("[saw] DATA seq={seq} acknowledged after {transmissions} transmission(s)");
                Ok(())
            }
            Err(e) => {
                self.sender.abandon();
                Err(e)
            }
        }
    }

    /// Wait for the next in-order payload.
    ///
    /// Returns `Ok(None)` once the peer has closed its side; every later call
    /// returns `Ok(None)` again.  Duplicates are re-acknowledged and never
    /// handed to the caller.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        let op = Operation::Receive;
        match self.state {
            ConnectionState::Established => {}
            ConnectionState::Closing(CloseOrigin::Peer) => return Ok(None),
            state @ (ConnectionState::Init
            | ConnectionState::Handshaking
            | ConnectionState::Closing(CloseOrigin::Local)
            | ConnectionState::Closed) => return Err(ConnError::InvalidState { op, state }),
        }

        loop {
            let (segment, _) = self.recv_blocking(op).await?;
            match segment.kind {
                SegmentType::Close => {
                    self.on_peer_close(op, segment.seq).await?;
                    return Ok(None);
                }
                SegmentType::Data => match self.receiver.on_data(segment.seq) {
                    Delivery::InOrder { ack } => {
                        self.transmit(op, &Segment::ack(ack)).await?;
                        return Ok(Some(segment.payload));
                    }
                    Delivery::Duplicate { ack } => {
                        log::debug!("[saw] duplicate DATA seq={}; re-ACK {ack}", segment.seq);
                        self.transmit(op, &Segment::ack(ack)).await?;
                    }
                    Delivery::Unexpected => {
                        log::debug!("[saw] discarding unexpected {segment}");
                    }
                },
                SegmentType::Conn | SegmentType::SynAck | SegmentType::Ack => {
                    match self.strays().answer(&segment) {
                        Verdict::Respond(answer) => self.transmit(op, &answer).await?,
                        _ => log::debug!("[saw] discarding stray {segment}"),
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared machinery
    // -----------------------------------------------------------------------

    /// Send `segment` and wait for a reply `classify` accepts, retransmitting
    /// with exponential backoff on every timeout.
    ///
    /// Replies that are discarded or answered do not extend the deadline.
    /// Returns the reply and how many times `segment` went out.
    pub(crate) async fn exchange<F>(
        &mut self,
        op: Operation,
        segment: &Segment,
        limit: Option<u32>,
        mut classify: F,
    ) -> Result<(Segment, u32), ConnError>
    where
        F: FnMut(&Segment) -> Verdict,
    {
        let tag = op.tag();
        let mut backoff = self.rto.backoff();
        let mut transmissions = 0u32;

        loop {
            self.transmit(op, segment).await?;
            transmissions += 1;
            let sent_at = Instant::now();
            let deadline = sent_at + backoff.timeout();

            while let Some(reply) = self.recv_until(op, deadline).await? {
                match classify(&reply) {
                    Verdict::Accept => {
                        self.record_round_trip(sent_at.elapsed());
                        return Ok((reply, transmissions));
                    }
                    Verdict::Interrupt => return Ok((reply, transmissions)),
                    Verdict::Respond(answer) => self.transmit(op, &answer).await?,
                    Verdict::Discard => {
                        log::debug!("[{tag}] discarding {reply} while waiting on {segment}");
                    }
                }
            }

            if limit.is_some_and(|max| backoff.timeouts() >= max) {
                log::warn!("[{tag}] {segment}: no reply after {transmissions} transmission(s)");
                return Err(ConnError::RetransmitLimit {
                    op,
                    attempts: transmissions,
                });
            }
            let next = backoff.on_timeout();
            log::debug!(
                "[{tag}] timeout #{} on {segment}; retransmitting, next wait {next:?}",
                backoff.timeouts()
            );
        }
    }

    /// Fold a completed round trip into the estimate and re-apply the RTO to
    /// the channel.
    fn record_round_trip(&mut self, rtt: Duration) {
        self.rto.record_sample(rtt);
        self.channel.set_receive_timeout(self.rto.current_rto());
    }

    /// Encode and send one segment.
    pub(crate) async fn transmit(&mut self, op: Operation, segment: &Segment) -> Result<(), ConnError> {
        let bytes = segment.encode().map_err(|_| ConnError::PayloadTooLarge {
            len: segment.payload.len(),
            max: MAX_PAYLOAD,
        })?;
        let sent = self.channel.send(&bytes).await;
        match sent {
            Ok(()) => {
                log::debug!("[{}] → {segment}", op.tag());
                Ok(())
            }
            Err(e) => Err(self.fail(op, e).await),
        }
    }

    /// Next well-formed segment from the peer, or `None` once `deadline`
    /// passes.
    pub(crate) async fn recv_until(
        &mut self,
        op: Operation,
        deadline: Instant,
    ) -> Result<Option<Segment>, ConnError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let received = self.channel.receive_with_timeout(&mut self.buf, remaining).await;
            match received {
                Ok(Some((n, from))) => {
                    if let Some(segment) = self.accept_datagram(op, n, from) {
                        return Ok(Some(segment));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.fail(op, e).await),
            }
        }
    }

    /// Next well-formed segment, however long it takes.  Each expiry of the
    /// channel's receive timeout just starts another wait.
    pub(crate) async fn recv_blocking(
        &mut self,
        op: Operation,
    ) -> Result<(Segment, SocketAddr), ConnError> {
        loop {
            let received = self.channel.receive(&mut self.buf).await;
            match received {
                Ok(Some((n, from))) => {
                    if let Some(segment) = self.accept_datagram(op, n, from) {
                        return Ok((segment, from));
                    }
                }
                Ok(None) => continue,
                Err(e) => return Err(self.fail(op, e).await),
            }
        }
    }

    /// Decode a datagram, dropping anything malformed or from a stranger.
    fn accept_datagram(&self, op: Operation, n: usize, from: SocketAddr) -> Option<Segment> {
        let tag = op.tag();
        if self.channel.peer_addr().is_some_and(|peer| peer != from) {
            log::debug!("[{tag}] ignoring datagram from stranger {from}");
            return None;
        }
        match Segment::decode(&self.buf[..n]) {
            Ok(segment) => {
                log::debug!("[{tag}] ← {segment}");
                Some(segment)
            }
            Err(e) => {
                log::warn!("[{tag}] discarding malformed datagram from {from}: {e}");
                None
            }
        }
    }

    /// Acknowledge the peer's CLOSE and remember it for `close()`.
    pub(crate) async fn on_peer_close(&mut self, op: Operation, seq: u32) -> Result<(), ConnError> {
        self.transmit(op, &Segment::ack(seq)).await?;
        self.peer_close_seq = Some(seq);
        self.state = ConnectionState::Closing(CloseOrigin::Peer);
        log::info!("[{}] peer closed the connection", op.tag());
        Ok(())
    }

    pub(crate) fn strays(&self) -> Strays {
        Strays {
            initiator: self.role == Role::Initiator,
            receiver: self.receiver,
        }
    }

    /// Release the channel after an unrecoverable transport error.
    async fn fail(&mut self, op: Operation, source: io::Error) -> ConnError {
        log::error!("[{}] {op} failed in state {}: {source}", op.tag(), self.state);
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            if let Err(e) = self.channel.close().await {
                log::debug!("[{}] channel release after failure: {e}", op.tag());
            }
        }
        ConnError::Transport { op, source }
    }
}
