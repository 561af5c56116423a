//! Three-way connection establishment.
//!
//! ```text
//!   Initiator                         Listener
//!   ─────────                         ────────
//!   CONN   ────────────────────────▶  (blocks until CONN arrives)
//!          ◀──────────────────────── SYNACK
//!   ACK    ────────────────────────▶
//!   Established                       Established
//! ```
//!
//! Either side retransmits its segment with exponential backoff until the
//! expected answer arrives.  Duplicates are answered idempotently: a repeated
//! CONN gets the same SYNACK, a repeated SYNACK gets the same ACK (that part
//! lives in [`crate::connection::Strays`] so it keeps working after the
//! handshake returns).
//!
//! The listener also treats the first DATA segment as proof that the
//! initiator is established: the final ACK was lost, and the DATA itself is
//! left for the next `receive` to re-request by retransmission.

use crate::connection::{ConnError, Connection, ConnectionConfig, Operation, Verdict};
use crate::packet::{Segment, SegmentType};
use crate::socket::{DatagramChannel, UdpChannel};
use crate::state::{ConnectionState, Role};

impl Connection<UdpChannel> {
    /// Bind `port` on all interfaces and block until a peer connects.
    pub async fn listen(port: u16) -> Result<Self, ConnError> {
        Self::listen_with(port, ConnectionConfig::default()).await
    }

    pub async fn listen_with(port: u16, config: ConnectionConfig) -> Result<Self, ConnError> {
        let op = Operation::Listen;
        let channel = UdpChannel::bind_port(port)
            .await
            .map_err(|source| ConnError::Transport { op, source })?;
        log::info!("[hs] listening on {}", channel.local_addr());
        let mut conn = Connection::new(channel, config);
        conn.accept().await?;
        Ok(conn)
    }

    /// Resolve `host`, open an ephemeral socket and perform the handshake.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ConnError> {
        Self::connect_with(host, port, ConnectionConfig::default()).await
    }

    pub async fn connect_with(
        host: &str,
        port: u16,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        let op = Operation::Connect;
        let channel = UdpChannel::connect(host, port)
            .await
            .map_err(|source| ConnError::Transport { op, source })?;
        let mut conn = Connection::new(channel, config);
        conn.initiate().await?;
        Ok(conn)
    }
}

impl<C: DatagramChannel> Connection<C> {
    /// Passive open: wait for a CONN, bind the channel to its sender and
    /// complete the handshake.
    ///
    /// On failure the channel is released and the connection is `Closed`.
    pub async fn accept(&mut self) -> Result<(), ConnError> {
        let op = Operation::Listen;
        self.begin_handshake(op, Role::Listener)?;

        let outcome = self.accept_handshake(op).await;
        self.finish_handshake(op, outcome).await
    }

    /// Active open over a channel already bound to the peer.
    ///
    /// On failure the channel is released and the connection is `Closed`.
    pub async fn initiate(&mut self) -> Result<(), ConnError> {
        let op = Operation::Connect;
        self.begin_handshake(op, Role::Initiator)?;

        let outcome = self.initiate_handshake(op).await;
        self.finish_handshake(op, outcome).await
    }

    fn begin_handshake(&mut self, op: Operation, role: Role) -> Result<(), ConnError> {
        if self.state != ConnectionState::Init {
            return Err(ConnError::InvalidState {
                op,
                state: self.state,
            });
        }
        self.role = role;
        self.state = ConnectionState::Handshaking;
        Ok(())
    }

    async fn accept_handshake(&mut self, op: Operation) -> Result<(), ConnError> {
        let peer = loop {
            let (segment, from) = self.recv_blocking(op).await?;
            if segment.kind == SegmentType::Conn {
                break from;
            }
            log::debug!("[hs] waiting for CONN; discarding {segment} from {from}");
        };
        log::info!("[hs] CONN from {peer}");
        if let Err(source) = self.channel.connect_remote(peer).await {
            return Err(ConnError::Transport { op, source });
        }

        let synack = Segment::control(SegmentType::SynAck, 0, 0);
        let answer = synack.clone();
        let limit = self.config.max_retransmits;
        let (reply, _) = self
            .exchange(op, &synack, limit, |reply| match reply.kind {
                SegmentType::Ack if reply.is_handshake_ack() => Verdict::Accept,
                SegmentType::Conn => Verdict::Respond(answer.clone()),
                SegmentType::Data => Verdict::Interrupt,
                SegmentType::Ack | SegmentType::SynAck | SegmentType::Close => Verdict::Discard,
            })
            .await?;

        if reply.kind == SegmentType::Data {
            log::debug!("[hs] final ACK lost; {reply} implies the peer is established");
        }
        Ok(())
    }

    async fn initiate_handshake(&mut self, op: Operation) -> Result<(), ConnError> {
        let conn = Segment::control(SegmentType::Conn, 0, 0);
        let limit = self.config.max_retransmits;
        self.exchange(op, &conn, limit, |reply| match reply.kind {
            SegmentType::SynAck => Verdict::Accept,
            _ => Verdict::Discard,
        })
        .await?;
        self.transmit(op, &Segment::handshake_ack()).await
    }

    async fn finish_handshake(
        &mut self,
        op: Operation,
        outcome: Result<(), ConnError>,
    ) -> Result<(), ConnError> {
        match outcome {
            Ok(()) => {
                self.state = ConnectionState::Established;
                log::info!(
                    "[hs] {op}: established with {} as {} (rto {:?})",
                    self.peer_display(),
                    self.role,
                    self.rto.current_rto()
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("[hs] {op} failed: {e}");
                if let Err(release) = self.release(op).await {
                    log::debug!("[hs] release after failed {op}: {release}");
                }
                Err(e)
            }
        }
    }

    fn peer_display(&self) -> String {
        self.channel
            .peer_addr()
            .map_or_else(|| "unknown peer".to_owned(), |peer| peer.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{FaultPlan, SimChannel, SimulatedLink};

    fn pair() -> (Connection<SimChannel>, Connection<SimChannel>) {
        let (a, b) = SimulatedLink::pair(FaultPlan::default(), FaultPlan::default());
        (
            Connection::new(a, ConnectionConfig::default()),
            Connection::new(b, ConnectionConfig::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn roles_are_assigned_by_open_direction() {
        let (mut listener, mut initiator) = pair();
        initiator
            .channel
            .connect_remote(SimulatedLink::A)
            .await
            .unwrap();

        let (l, i) = tokio::join!(listener.accept(), initiator.initiate());
        l.unwrap();
        i.unwrap();

        assert_eq!(listener.role(), Role::Listener);
        assert_eq!(initiator.role(), Role::Initiator);
        assert_eq!(listener.state(), ConnectionState::Established);
        assert_eq!(initiator.state(), ConnectionState::Established);
        assert_eq!(listener.peer_addr(), Some(SimulatedLink::B));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_only_runs_from_init() {
        let (mut listener, mut initiator) = pair();
        initiator
            .channel
            .connect_remote(SimulatedLink::A)
            .await
            .unwrap();
        let (l, i) = tokio::join!(listener.accept(), initiator.initiate());
        l.unwrap();
        i.unwrap();

        let err = initiator.initiate().await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::InvalidState {
                op: Operation::Connect,
                state: ConnectionState::Established
            }
        ));
        assert_eq!(initiator.role(), Role::Initiator);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_connect_releases_the_channel() {
        let (a, _b) = SimulatedLink::pair(FaultPlan::black_hole(), FaultPlan::default());
        let config = ConnectionConfig {
            max_retransmits: Some(3),
            ..ConnectionConfig::default()
        };
        let mut conn = Connection::new(a, config);
        conn.channel.connect_remote(SimulatedLink::B).await.unwrap();

        let err = conn.initiate().await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::RetransmitLimit {
                op: Operation::Connect,
                attempts: 4
            }
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.channel().is_closed());
    }
}
