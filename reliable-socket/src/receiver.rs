//! Inbound DATA sequencing.
//!
//! The [`Receiver`] decides what happens to a DATA segment once it has been
//! decoded:
//! - In-order (`seq == expect_sequence`): deliver and acknowledge it.
//! - Anything else: with one segment in flight this can only be the peer
//!   retransmitting because our ACK was lost, so re-acknowledge the last
//!   delivered segment and keep waiting.
//!
//! The [`Receiver`] does **not** send ACKs itself; it returns the values
//! that [`crate::connection::Connection`] puts in outbound ACK segments.

/// What to do with an inbound DATA segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// New in-order segment: hand the payload to the application and ACK `seq`.
    InOrder { ack: u32 },
    /// Already delivered: re-send the ACK for the previous expected value.
    Duplicate { ack: u32 },
    /// Nothing delivered yet, so there is nothing to re-acknowledge.
    Unexpected,
}

/// Receive-side state of a single connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Receiver {
    /// Sequence number of the next in-order DATA segment.
    expect_seq: u32,
    /// Set once the first segment is delivered; distinguishes "nothing yet"
    /// from a wrapped `expect_seq` of zero.
    delivered_any: bool,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current `expect_sequence`.
    pub fn expect_seq(&self) -> u32 {
        self.expect_seq
    }

    /// Sequence number of the most recently delivered segment.
    pub fn last_delivered(&self) -> Option<u32> {
        self.delivered_any
            .then(|| self.expect_seq.wrapping_sub(1))
    }

    /// Classify an inbound DATA segment, advancing `expect_seq` when it is
    /// the one we were waiting for.
    pub fn on_data(&mut self, seq: u32) -> Delivery {
        if seq == self.expect_seq {
            self.expect_seq = self.expect_seq.wrapping_add(1);
            self.delivered_any = true;
            return Delivery::InOrder { ack: seq };
        }
        match self.last_delivered() {
            Some(ack) => Delivery::Duplicate { ack },
            None => Delivery::Unexpected,
        }
    }

    /// ACK to repeat for a DATA segment seen outside `receive`.
    ///
    /// Never acknowledges the expected segment, because nothing is there to
    /// accept its payload.
    pub fn reack_for(&self, seq: u32) -> Option<u32> {
        if seq == self.expect_seq {
            None
        } else {
            self.last_delivered()
        }
    }
}
