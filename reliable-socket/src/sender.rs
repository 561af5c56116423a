//! Outbound segment state for stop-and-wait reliability.
//!
//! [`Sender`] tracks `send_sequence` and which sequence number is in flight.
//! It does **not** touch the channel; [`crate::connection::Connection`] calls
//! these methods and owns the actual send/receive loop, including the copy
//! of the segment it retransmits.
//!
//! # Stop-and-Wait contract
//! - At most **one** segment is in flight at any moment.
//! - A new segment may only be started once nothing is in flight.
//! - On the ACK carrying the in-flight sequence number: advance
//!   `next_seq` by one and clear the in-flight marker.
//! - On timeout the connection resends the same segment unchanged.

use crate::packet::Segment;

/// Stop-and-wait send-side state for one connection.
#[derive(Debug, Default)]
pub struct Sender {
    /// Sequence number of the **next** DATA segment.
    ///
    /// Advances by exactly one per acknowledged segment and never moves
    /// while a segment is in flight.
    next_seq: u32,

    /// Sequence number of the unacknowledged segment, if any.
    in_flight: Option<u32>,
}

impl Sender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current `send_sequence`.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight
    }

    /// Build the DATA segment for `payload` at the current sequence number
    /// and mark it in flight.
    pub fn begin(&mut self, payload: &[u8]) -> Segment {
        debug_assert!(
            self.in_flight.is_none(),
            "begin called while a segment is already in flight"
        );
        self.in_flight = Some(self.next_seq);
        Segment::data(self.next_seq, payload.to_vec())
    }

    /// Process an inbound ACK number.
    ///
    /// Returns `true` if it acknowledged the in-flight segment, in which case
    /// `next_seq` advances and the marker is cleared.  Duplicate or stale
    /// ACKs return `false` and change nothing.
    pub fn on_ack(&mut self, ack_num: u32) -> bool {
        if self.in_flight != Some(ack_num) {
            return false;
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        self.in_flight = None;
        true
    }

    /// Forget the in-flight segment without advancing (the send was abandoned).
    pub fn abandon(&mut self) {
        self.in_flight = None;
    }
}
