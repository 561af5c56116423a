//! Integration tests for the three-way handshake over real UDP.
//!
//! Each test binds a listener on an OS-chosen loopback port, runs both halves
//! concurrently in the test task, and checks where both sides end up.

use std::net::SocketAddr;
use std::time::Duration;

use reliable_socket::{
    ConnError, Connection, ConnectionConfig, ConnectionState, DatagramChannel, Operation, Role,
    UdpChannel,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Bind a listener on loopback and return it with the port to connect to.
async fn bind_listener() -> (Connection<UdpChannel>, u16) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let channel = UdpChannel::bind(addr).await.expect("bind listener socket");
    let port = channel.local_addr().port();
    (Connection::new(channel, ConnectionConfig::default()), port)
}

/// Handshake a fresh pair; returns `(listener, initiator)`.
async fn established_pair() -> (Connection<UdpChannel>, Connection<UdpChannel>) {
    let (mut listener, port) = bind_listener().await;
    let (accepted, connected) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(listener.accept(), Connection::connect("127.0.0.1", port))
    })
    .await
    .expect("handshake timed out");
    accepted.expect("listener accept failed");
    let initiator = connected.expect("initiator connect failed");
    (listener, initiator)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Both sides should reach `Established` after a clean handshake on loopback.
#[tokio::test]
async fn handshake_both_sides_reach_established() {
    let (listener, initiator) = established_pair().await;

    assert_eq!(listener.state(), ConnectionState::Established);
    assert_eq!(initiator.state(), ConnectionState::Established);
    assert_eq!(listener.role(), Role::Listener);
    assert_eq!(initiator.role(), Role::Initiator);
}

/// The listener locks onto the initiator's address.
#[tokio::test]
async fn listener_binds_to_first_peer() {
    let (listener, initiator) = established_pair().await;
    let peer = listener.peer_addr().expect("listener bound to a peer");
    assert_eq!(peer.port(), initiator.channel().local_addr().port());
    assert!(peer.ip().is_loopback());
}

/// Both sequence counters start at zero on both sides.
#[tokio::test]
async fn sequences_start_at_zero() {
    let (listener, initiator) = established_pair().await;
    for conn in [&listener, &initiator] {
        assert_eq!(conn.send_sequence(), 0);
        assert_eq!(conn.expect_sequence(), 0);
    }
}

/// Operations before the handshake are rejected without touching the wire.
#[tokio::test]
async fn transfer_before_handshake_is_rejected() {
    let (mut listener, _port) = bind_listener().await;

    let err = listener.send(b"too early").await.unwrap_err();
    assert!(matches!(
        err,
        ConnError::InvalidState {
            op: Operation::Send,
            state: ConnectionState::Init
        }
    ));
    let err = listener.receive().await.unwrap_err();
    assert!(matches!(
        err,
        ConnError::InvalidState {
            op: Operation::Receive,
            state: ConnectionState::Init
        }
    ));
    assert_eq!(listener.state(), ConnectionState::Init);
}

/// A second accept on an established connection is misuse.
#[tokio::test]
async fn accept_twice_is_rejected() {
    let (mut listener, _initiator) = established_pair().await;
    let err = listener.accept().await.unwrap_err();
    assert!(matches!(
        err,
        ConnError::InvalidState {
            op: Operation::Listen,
            state: ConnectionState::Established
        }
    ));
}

/// With nobody listening, a bounded connect gives up and releases its socket.
#[tokio::test]
async fn bounded_connect_without_listener_gives_up() {
    let (listener, port) = bind_listener().await;
    drop(listener);

    let config = ConnectionConfig {
        max_retransmits: Some(2),
        ..ConnectionConfig::default()
    };
    let err = Connection::connect_with("127.0.0.1", port, config)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnError::RetransmitLimit {
            op: Operation::Connect,
            attempts: 3
        }
    ));
}

/// Messages flow both ways and teardown releases both sockets.
#[tokio::test]
async fn end_to_end_exchange_and_close() {
    let (mut listener, mut initiator) = established_pair().await;

    let (sent, received) = tokio::join!(initiator.send(b"ping"), listener.receive());
    sent.unwrap();
    assert_eq!(received.unwrap().as_deref(), Some(&b"ping"[..]));

    let (sent, received) = tokio::join!(listener.send(b"pong"), initiator.receive());
    sent.unwrap();
    assert_eq!(received.unwrap().as_deref(), Some(&b"pong"[..]));

    let (initiator_closed, (eof, listener_closed)) =
        tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(initiator.close(), async {
                let eof = listener.receive().await;
                (eof, listener.close().await)
            })
        })
        .await
        .expect("teardown timed out");
    initiator_closed.unwrap();
    assert_eq!(eof.unwrap(), None);
    listener_closed.unwrap();

    assert_eq!(initiator.state(), ConnectionState::Closed);
    assert_eq!(listener.state(), ConnectionState::Closed);
    assert!(initiator.channel().is_closed());
    assert!(listener.channel().is_closed());
    assert!(listener.channel().peer_addr().is_some());
}
