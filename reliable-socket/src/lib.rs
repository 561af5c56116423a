//! `reliable-socket`: a reliable, ordered, connection-oriented message
//! channel over UDP using stop-and-wait retransmission.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   DATA    ┌──────────┐
//!  │  Sender  │──────────▶│ Receiver │
//!  └────┬─────┘           └─────┬────┘
//!       │        ACK            │
//!       │◀──────────────────────┘
//!       │
//!  ┌────▼──────────────────────────────────────┐
//!  │                Connection                 │
//!  │  FSM + RTO estimate + send-and-wait loop  │
//!  │  (handshake / transfer / teardown)        │
//!  └────┬──────────────────────────────────────┘
//!       │ opaque datagrams
//!  ┌────▼────────────┐
//!  │ DatagramChannel │  UdpChannel in production, SimChannel in tests
//!  └─────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]:      wire format (serialise / deserialise)
//! - [`state`]:       connection state and role types
//! - [`timer`]:       RTT estimation, RTO and exponential backoff
//! - [`sender`]:      stop-and-wait outbound sequencing
//! - [`receiver`]:    in-order delivery and duplicate detection
//! - [`connection`]:  per-connection engine, `send` / `receive`
//! - [`handshake`]:   three-way open (`listen` / `connect`)
//! - [`teardown`]:    `close` and time-wait
//! - [`socket`]:      datagram channel trait and the UDP implementation
//! - [`simulator`]:   lossy in-memory channel for tests

pub mod connection;
pub mod handshake;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod teardown;
pub mod timer;

pub use connection::{ConnError, Connection, ConnectionConfig, Operation};
pub use packet::{Segment, SegmentType, MAX_PAYLOAD};
pub use socket::{DatagramChannel, UdpChannel};
pub use state::{CloseOrigin, ConnectionState, Role};
pub use timer::{DeviationBasis, TimerConfig};
