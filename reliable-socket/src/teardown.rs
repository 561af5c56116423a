//! Connection teardown.
//!
//! ```text
//!   Closer                              Peer
//!   ──────                              ────
//!   CLOSE(s) ────────────────────────▶  receive() → None
//!            ◀──────────────────────── ACK(s)
//!                                       close()
//!            ◀──────────────────────── CLOSE(p)
//!   ACK(p)   ────────────────────────▶  released
//!   time-wait (re-ACK any repeated CLOSE(p))
//!   released
//! ```
//!
//! Every wait is bounded: CLOSE is retransmitted at most
//! `close_retransmits` times, the wait for the peer's CLOSE is capped by
//! `peer_close_timeout`, and time-wait lasts `max(2 × RTO, min_time_wait)`
//! after the last CLOSE seen.  Running out of any of these releases the
//! channel anyway.

use std::time::Duration;

use tokio::time::Instant;

use crate::connection::{ConnError, Connection, Operation, Verdict};
use crate::packet::{Segment, SegmentType};
use crate::socket::DatagramChannel;
use crate::state::{CloseOrigin, ConnectionState};

impl<C: DatagramChannel> Connection<C> {
    /// Shut the connection down and release the channel.
    ///
    /// From `Init` or `Handshaking` this only releases the channel.  A second
    /// call fails with [`ConnError::InvalidState`].
    pub async fn close(&mut self) -> Result<(), ConnError> {
        let op = Operation::Close;
        let outcome = match self.state {
            ConnectionState::Established => self.close_local(op).await,
            ConnectionState::Closing(CloseOrigin::Peer) => self.close_after_peer(op).await,
            ConnectionState::Init | ConnectionState::Handshaking => Ok(()),
            state @ (ConnectionState::Closing(CloseOrigin::Local) | ConnectionState::Closed) => {
                return Err(ConnError::InvalidState { op, state })
            }
        };
        let released = self.release(op).await;
        outcome.and(released)
    }

    /// Time-wait length for the current RTO estimate.
    pub fn time_wait_interval(&self) -> Duration {
        (self.rto.current_rto() * 2).max(self.config.min_time_wait)
    }

    /// Close the channel and enter `Closed`.  No-op when already closed.
    pub(crate) async fn release(&mut self, op: Operation) -> Result<(), ConnError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.channel
            .close()
            .await
            .map_err(|source| ConnError::Transport { op, source })?;
        log::info!("[close] connection released");
        Ok(())
    }

    /// We close first.
    async fn close_local(&mut self, op: Operation) -> Result<(), ConnError> {
        self.state = ConnectionState::Closing(CloseOrigin::Local);
        let close = Segment::control(SegmentType::Close, self.sender.next_seq(), 0);
        let close_seq = close.seq;

        let strays = self.strays();
        let limit = Some(self.config.close_retransmits);
        let outcome = self
            .exchange(op, &close, limit, |reply| match reply.kind {
                SegmentType::Ack if reply.acknowledges(close_seq) => Verdict::Accept,
                SegmentType::Close => Verdict::Interrupt,
                _ => strays.answer(reply),
            })
            .await;
        let reply = match outcome {
            Ok((reply, _)) => reply,
            Err(ConnError::RetransmitLimit { attempts, .. }) => {
                log::warn!("[close] CLOSE seq={close_seq} unacknowledged after {attempts} transmissions; releasing");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let (peer_seq, local_acked) = if reply.kind == SegmentType::Close {
            log::info!("[close] simultaneous close");
            (reply.seq, false)
        } else {
            match self.await_peer_close(op, close_seq).await? {
                Some(seq) => (seq, true),
                None => {
                    log::warn!(
                        "[close] peer never sent CLOSE within {:?}; releasing",
                        self.config.peer_close_timeout
                    );
                    return Ok(());
                }
            }
        };
        self.peer_close_seq = Some(peer_seq);
        self.time_wait(op, &close, peer_seq, local_acked).await
    }

    /// Our CLOSE is acknowledged; wait for the peer's own CLOSE.
    async fn await_peer_close(&mut self, op: Operation, close_seq: u32) -> Result<Option<u32>, ConnError> {
        let strays = self.strays();
        let deadline = Instant::now() + self.config.peer_close_timeout;
        while let Some(segment) = self.recv_until(op, deadline).await? {
            match segment.kind {
                SegmentType::Close => return Ok(Some(segment.seq)),
                SegmentType::Ack if segment.acknowledges(close_seq) => {
                    log::debug!("[close] duplicate ACK for our CLOSE");
                }
                _ => {
                    if let Verdict::Respond(answer) = strays.answer(&segment) {
                        self.transmit(op, &answer).await?;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Acknowledge the peer's CLOSE and linger so a lost final ACK can be
    /// repeated.  Each repeated CLOSE restarts the interval.
    async fn time_wait(
        &mut self,
        op: Operation,
        close: &Segment,
        peer_seq: u32,
        mut local_acked: bool,
    ) -> Result<(), ConnError> {
        let final_ack = Segment::ack(peer_seq);
        self.transmit(op, &final_ack).await?;

        let strays = self.strays();
        let interval = self.time_wait_interval();
        log::debug!("[close] time-wait {interval:?}");
        let mut deadline = Instant::now() + interval;

        while let Some(segment) = self.recv_until(op, deadline).await? {
            match segment.kind {
                SegmentType::Close => {
                    log::debug!("[close] repeated CLOSE; re-sending final ACK");
                    self.transmit(op, &final_ack).await?;
                    if !local_acked {
                        self.transmit(op, close).await?;
                    }
                    deadline = Instant::now() + interval;
                }
                SegmentType::Ack if segment.acknowledges(close.seq) => local_acked = true,
                _ => {
                    if let Verdict::Respond(answer) = strays.answer(&segment) {
                        self.transmit(op, &answer).await?;
                    }
                }
            }
        }

        if !local_acked {
            log::debug!("[close] CLOSE seq={} never acknowledged; peer is gone", close.seq);
        }
        Ok(())
    }

    /// The peer closed first and we already acknowledged its CLOSE.
    async fn close_after_peer(&mut self, op: Operation) -> Result<(), ConnError> {
        let Some(peer_seq) = self.peer_close_seq else {
            return Err(ConnError::InvalidState {
                op,
                state: self.state,
            });
        };
        let close = Segment::control(SegmentType::Close, self.sender.next_seq(), 0);
        let close_seq = close.seq;

        let strays = self.strays();
        let limit = Some(self.config.close_retransmits);
        let outcome = self
            .exchange(op, &close, limit, |reply| match reply.kind {
                SegmentType::Ack if reply.acknowledges(close_seq) => Verdict::Accept,
                // Our ACK of their CLOSE went missing.
                SegmentType::Close => Verdict::Respond(Segment::ack(peer_seq)),
                _ => strays.answer(reply),
            })
            .await;
        match outcome {
            Ok(_) => Ok(()),
            Err(ConnError::RetransmitLimit { attempts, .. }) => {
                log::warn!("[close] CLOSE seq={close_seq} unacknowledged after {attempts} transmissions; releasing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::simulator::{FaultPlan, SimulatedLink};

    #[tokio::test]
    async fn time_wait_never_drops_below_the_floor() {
        let (a, _b) = SimulatedLink::pair(FaultPlan::default(), FaultPlan::default());
        let conn = Connection::new(a, ConnectionConfig::default());
        // 2 × 140ms initial RTO is below the 500ms default floor.
        assert_eq!(conn.time_wait_interval(), Duration::from_millis(500));

        let (a, _b) = SimulatedLink::pair(FaultPlan::default(), FaultPlan::default());
        let config = ConnectionConfig {
            min_time_wait: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let conn = Connection::new(a, config);
        assert_eq!(conn.time_wait_interval(), Duration::from_millis(280));
    }

    #[tokio::test]
    async fn closing_before_handshake_only_releases() {
        let (a, _b) = SimulatedLink::pair(FaultPlan::default(), FaultPlan::default());
        let mut conn = Connection::new(a, ConnectionConfig::default());
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.channel().is_closed());
        assert_eq!(conn.channel().stats().sent(SegmentType::Close), 0);

        let err = conn.close().await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::InvalidState {
                op: Operation::Close,
                state: ConnectionState::Closed
            }
        ));
    }
}
