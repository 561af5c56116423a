//! Integration tests for connection teardown.
//!
//! Runs over a [`SimulatedLink`] with paused time so time-wait and
//! retransmission timeouts pass instantly.

use std::time::Duration;

use reliable_socket::{
    simulator::{DropRule, FaultPlan, SimChannel, SimulatedLink},
    CloseOrigin, ConnError, Connection, ConnectionConfig, ConnectionState, DatagramChannel,
    Operation, SegmentType,
};

/// Returns an established `(listener, initiator)` pair.
async fn established_with(
    listener_faults: FaultPlan,
    initiator_faults: FaultPlan,
    config: ConnectionConfig,
) -> (Connection<SimChannel>, Connection<SimChannel>) {
    let (a, mut b) = SimulatedLink::pair(listener_faults, initiator_faults);
    b.connect_remote(SimulatedLink::A).await.expect("bind initiator");
    let mut listener = Connection::new(a, config.clone());
    let mut initiator = Connection::new(b, config);
    let (accepted, initiated) = tokio::join!(listener.accept(), initiator.initiate());
    accepted.expect("accept");
    initiated.expect("initiate");
    (listener, initiator)
}

async fn established() -> (Connection<SimChannel>, Connection<SimChannel>) {
    established_with(
        FaultPlan::default(),
        FaultPlan::default(),
        ConnectionConfig::default(),
    )
    .await
}

/// `closer` calls `close()`; `peer` drains to end-of-connection, then closes.
async fn close_in_order(
    closer: &mut Connection<SimChannel>,
    peer: &mut Connection<SimChannel>,
) {
    let (closed, (eof, peer_closed)) = tokio::join!(closer.close(), async {
        let eof = peer.receive().await;
        (eof, peer.close().await)
    });
    closed.expect("closer close");
    assert_eq!(eof.expect("peer receive"), None);
    peer_closed.expect("peer close");
}

fn assert_released(conn: &Connection<SimChannel>) {
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.channel().is_closed());
}

// ---------------------------------------------------------------------------
// Clean teardown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn initiator_closes_first() {
    let (mut listener, mut initiator) = established().await;
    close_in_order(&mut initiator, &mut listener).await;

    assert_released(&initiator);
    assert_released(&listener);
    assert_eq!(initiator.channel().stats().sent(SegmentType::Close), 1);
    assert_eq!(listener.channel().stats().sent(SegmentType::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn listener_closes_first() {
    let (mut listener, mut initiator) = established().await;
    close_in_order(&mut listener, &mut initiator).await;

    assert_released(&initiator);
    assert_released(&listener);
}

#[tokio::test(start_paused = true)]
async fn close_after_transfer_uses_next_sequence() {
    let (mut listener, mut initiator) = established().await;
    for payload in [&b"a"[..], &b"b"[..]] {
        let (sent, received) = tokio::join!(initiator.send(payload), listener.receive());
        sent.unwrap();
        received.unwrap();
    }
    assert_eq!(initiator.send_sequence(), 2);
    close_in_order(&mut initiator, &mut listener).await;
    assert_released(&initiator);
    assert_released(&listener);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_close_completes_on_both_sides() {
    let (mut listener, mut initiator) = established().await;

    let (a, b) = tokio::join!(listener.close(), initiator.close());
    a.unwrap();
    b.unwrap();

    assert_released(&listener);
    assert_released(&initiator);
}

/// The caller-initiated side lingers for the time-wait interval.
#[tokio::test(start_paused = true)]
async fn closer_lingers_in_time_wait() {
    let (mut listener, mut initiator) = established().await;
    let time_wait = initiator.time_wait_interval();
    assert!(time_wait >= Duration::from_millis(500));

    let started = tokio::time::Instant::now();
    close_in_order(&mut initiator, &mut listener).await;
    assert!(started.elapsed() >= time_wait);
}

// ---------------------------------------------------------------------------
// Teardown under loss
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lost_close_is_retransmitted() {
    let (mut listener, mut initiator) = established_with(
        FaultPlan::default(),
        FaultPlan::dropping([DropRule::first(SegmentType::Close)]),
        ConnectionConfig::default(),
    )
    .await;
    close_in_order(&mut initiator, &mut listener).await;

    assert_eq!(initiator.channel().stats().sent(SegmentType::Close), 2);
    assert_released(&initiator);
    assert_released(&listener);
}

/// The peer's CLOSE is repeated until the closer's final ACK gets through.
#[tokio::test(start_paused = true)]
async fn lost_final_ack_is_repeated_from_time_wait() {
    // Initiator ACKs: #1 finishes the handshake, #2 is the final ACK.
    let (mut listener, mut initiator) = established_with(
        FaultPlan::default(),
        FaultPlan::dropping([DropRule::nth(SegmentType::Ack, 2)]),
        ConnectionConfig::default(),
    )
    .await;
    close_in_order(&mut initiator, &mut listener).await;

    let stats = initiator.channel().stats();
    assert_eq!(stats.sent(SegmentType::Ack), 3);
    assert_eq!(stats.dropped(SegmentType::Ack), 1);
    assert_eq!(listener.channel().stats().sent(SegmentType::Close), 2);
    assert_released(&initiator);
    assert_released(&listener);
}

/// When the ACK for the closer's CLOSE is lost, the peer's own CLOSE still
/// moves the closer on to time-wait.
#[tokio::test(start_paused = true)]
async fn lost_ack_of_close_is_tolerated() {
    let (mut listener, mut initiator) = established_with(
        FaultPlan::dropping([DropRule::first(SegmentType::Ack)]),
        FaultPlan::default(),
        ConnectionConfig::default(),
    )
    .await;
    close_in_order(&mut initiator, &mut listener).await;

    assert_eq!(listener.channel().stats().dropped(SegmentType::Ack), 1);
    assert_released(&initiator);
    assert_released(&listener);
}

/// Repeated SYNACKs over a slow link produce handshake ACKs that reach the
/// listener while its CLOSE seq 0 is outstanding.  They must not count as the
/// ACK of that CLOSE.
#[tokio::test(start_paused = true)]
async fn late_handshake_ack_never_acknowledges_close() {
    let latency = Duration::from_millis(100);
    let (mut listener, mut initiator) = established_with(
        FaultPlan {
            latency,
            ..FaultPlan::dropping([DropRule::first(SegmentType::Close)])
        },
        FaultPlan::default().with_latency(latency),
        ConnectionConfig::default(),
    )
    .await;

    let started = tokio::time::Instant::now();
    close_in_order(&mut listener, &mut initiator).await;

    assert_eq!(listener.channel().stats().sent(SegmentType::Close), 2);
    assert!(started.elapsed() < listener.config().peer_close_timeout);
    assert_released(&listener);
    assert_released(&initiator);
}

async fn slow_established() -> (Connection<SimChannel>, Connection<SimChannel>) {
    let slow = || FaultPlan::default().with_latency(Duration::from_millis(300));
    let (mut listener, mut initiator) =
        established_with(slow(), slow(), ConnectionConfig::default()).await;

    let (sent, received) = tokio::join!(initiator.send(b"up"), listener.receive());
    sent.unwrap();
    assert_eq!(received.unwrap().as_deref(), Some(&b"up"[..]));
    let (sent, received) = tokio::join!(listener.send(b"down"), initiator.receive());
    sent.unwrap();
    assert_eq!(received.unwrap().as_deref(), Some(&b"down"[..]));
    (listener, initiator)
}

/// One-way latency above the RTO: CLOSE and the peer's CLOSE are both
/// retransmitted before their ACKs can arrive.
#[tokio::test(start_paused = true)]
async fn initiator_closes_first_over_a_slow_link() {
    let (mut listener, mut initiator) = slow_established().await;
    close_in_order(&mut initiator, &mut listener).await;

    assert_released(&initiator);
    assert_released(&listener);
}

#[tokio::test(start_paused = true)]
async fn listener_closes_first_over_a_slow_link() {
    let (mut listener, mut initiator) = slow_established().await;
    close_in_order(&mut listener, &mut initiator).await;

    assert_released(&initiator);
    assert_released(&listener);
}

#[tokio::test(start_paused = true)]
async fn vanished_peer_releases_after_bounded_retries() {
    let (listener, mut initiator) = established().await;
    drop(listener);

    initiator.close().await.unwrap();

    let close_retransmits = initiator.config().close_retransmits;
    assert_eq!(
        initiator.channel().stats().sent(SegmentType::Close),
        close_retransmits + 1
    );
    assert_released(&initiator);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_abandoned_after_peer_close_timeout() {
    let config = ConnectionConfig {
        peer_close_timeout: Duration::from_secs(2),
        ..ConnectionConfig::default()
    };
    let (mut listener, mut initiator) =
        established_with(FaultPlan::default(), FaultPlan::default(), config).await;

    // The listener acknowledges the CLOSE but never closes its own side.
    let (closed, eof) = tokio::join!(initiator.close(), listener.receive());
    closed.unwrap();
    assert_eq!(eof.unwrap(), None);

    assert_released(&initiator);
    assert_eq!(
        listener.state(),
        ConnectionState::Closing(CloseOrigin::Peer)
    );
}

// ---------------------------------------------------------------------------
// Peer close during transfer, and misuse afterwards
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn close_during_send_aborts_the_send() {
    let (mut listener, mut initiator) = established().await;

    let ((sent, listener_closed), initiator_closed) = tokio::join!(
        async {
            let sent = listener.send(b"too late").await;
            (sent, listener.close().await)
        },
        initiator.close()
    );
    assert!(matches!(
        sent.unwrap_err(),
        ConnError::PeerClosed { op: Operation::Send }
    ));
    listener_closed.unwrap();
    initiator_closed.unwrap();

    assert_eq!(listener.send_sequence(), 0);
    assert_released(&listener);
    assert_released(&initiator);
}

#[tokio::test(start_paused = true)]
async fn end_of_connection_is_sticky() {
    let (mut listener, mut initiator) = established().await;

    let (_, eof) = tokio::join!(initiator.close(), async {
        let first = listener.receive().await;
        let second = listener.receive().await;
        let send = listener.send(b"x").await;
        let closed = listener.close().await;
        (first, second, send, closed)
    });
    let (first, second, send, closed) = eof;
    assert_eq!(first.unwrap(), None);
    assert_eq!(second.unwrap(), None);
    assert!(matches!(
        send.unwrap_err(),
        ConnError::InvalidState {
            op: Operation::Send,
            state: ConnectionState::Closing(CloseOrigin::Peer)
        }
    ));
    closed.unwrap();
}

#[tokio::test(start_paused = true)]
async fn closed_connection_rejects_everything() {
    let (mut listener, mut initiator) = established().await;
    close_in_order(&mut initiator, &mut listener).await;

    for conn in [&mut listener, &mut initiator] {
        assert!(matches!(
            conn.send(b"x").await.unwrap_err(),
            ConnError::InvalidState {
                op: Operation::Send,
                state: ConnectionState::Closed
            }
        ));
        assert!(matches!(
            conn.receive().await.unwrap_err(),
            ConnError::InvalidState {
                op: Operation::Receive,
                state: ConnectionState::Closed
            }
        ));
        assert!(matches!(
            conn.close().await.unwrap_err(),
            ConnError::InvalidState {
                op: Operation::Close,
                state: ConnectionState::Closed
            }
        ));
    }
}
