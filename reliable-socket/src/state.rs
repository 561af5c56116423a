//! Connection finite-state machine (FSM) types.
//!
//! Every [`crate::connection::Connection`] carries one [`ConnectionState`]
//! and one [`Role`].  Transitions live in the handshake, transfer and
//! teardown code; this module only names the states and which operations
//! each of them admits.
//!
//! ```text
//!  INIT ──accept/initiate──▶ HANDSHAKING ──ACK / SYNACK──▶ ESTABLISHED
//!                                                              │
//!                                   close() or peer CLOSE      │
//!                                                              ▼
//!                                  CLOSED ◀──channel released── CLOSING
//! ```

use std::fmt;

/// All possible states of the connection FSM.
///
/// Transitions only move forward; `Closing → Closed` is the sole terminal
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Channel is open but no handshake has started.
    #[default]
    Init,
    /// CONN / SYNACK exchange in progress.
    Handshaking,
    /// Handshake complete; data transfer allowed.
    Established,
    /// Teardown in progress or pending.
    Closing(CloseOrigin),
    /// Channel released.  Nothing may run against this connection.
    Closed,
}

/// Which side asked to tear the connection down first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    /// Local `close()` sent the first CLOSE.
    Local,
    /// A CLOSE from the peer was observed (and acknowledged) first.
    Peer,
}

/// Which end of the handshake this connection played.  Fixed once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Uninitialized,
    Listener,
    Initiator,
}

impl ConnectionState {
    /// `true` once the peer has told us it will send nothing more.
    pub fn peer_closed(self) -> bool {
        matches!(self, Self::Closing(CloseOrigin::Peer))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("Init"),
            Self::Handshaking => f.write_str("Handshaking"),
            Self::Established => f.write_str("Established"),
            Self::Closing(CloseOrigin::Local) => f.write_str("Closing (local)"),
            Self::Closing(CloseOrigin::Peer) => f.write_str("Closing (peer)"),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
