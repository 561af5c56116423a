//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a single [`Segment`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (type, sequence, ack, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for truncated or unknown input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |             Sequence Number                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |          Acknowledgment Number                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |          Payload ... (DATA only)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 9 bytes.
//! type(1) + seq(4) + ack(4).  The payload length is implied by the datagram
//! length; the transport never corrupts, so there is no checksum.

use std::fmt;

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 9;

/// Largest datagram either peer will ever send, header included.
pub const MAX_SEGMENT_SIZE: usize = 1400;

/// Largest payload a single DATA segment can carry.
pub const MAX_PAYLOAD: usize = MAX_SEGMENT_SIZE - HEADER_LEN;

/// `seq` of the ACK that completes the handshake.  ACKs for DATA and CLOSE
/// always carry `seq = 0`, so the two can never be confused.
pub const HANDSHAKE_ACK_SEQ: u32 = 1;

// Byte offsets of each field within the serialised header.
const OFF_TYPE: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_ACK: usize = 5;

/// Segment type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentType {
    /// Connection request from the initiator.
    Conn = 0,
    /// Listener's answer to `Conn`.
    SynAck = 1,
    /// Acknowledges a handshake, a data segment, or a close.
    Ack = 2,
    /// Carries application payload.
    Data = 3,
    /// Sender is done; begin teardown.
    Close = 4,
}

impl TryFrom<u8> for SegmentType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Conn),
            1 => Ok(Self::SynAck),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Data),
            4 => Ok(Self::Close),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Conn => "CONN",
            Self::SynAck => "SYNACK",
            Self::Ack => "ACK",
            Self::Data => "DATA",
            Self::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram: header fields + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentType,
    /// Sender's sequence value for this segment.
    pub seq: u32,
    /// Value being acknowledged; meaningful only on [`SegmentType::Ack`].
    pub ack: u32,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Header-only segment of the given type.
    pub fn control(kind: SegmentType, seq: u32, ack: u32) -> Self {
        Self {
            kind,
            seq,
            ack,
            payload: Vec::new(),
        }
    }

    /// Acknowledgment of the DATA or CLOSE segment numbered `acked`.
    pub fn ack(acked: u32) -> Self {
        Self::control(SegmentType::Ack, 0, acked)
    }

    /// Final message of the three-way handshake.
    pub fn handshake_ack() -> Self {
        Self::control(SegmentType::Ack, HANDSHAKE_ACK_SEQ, 0)
    }

    pub fn is_handshake_ack(&self) -> bool {
        self.kind == SegmentType::Ack && self.seq == HANDSHAKE_ACK_SEQ
    }

    /// `true` if this is the ACK for the DATA or CLOSE numbered `seq`.
    pub fn acknowledges(&self, seq: u32) -> bool {
        self.kind == SegmentType::Ack && self.seq == 0 && self.ack == seq
    }

    pub fn data(seq: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: SegmentType::Data,
            seq,
            ack: 0,
            payload,
        }
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// Fails only if the payload would push the datagram past
    /// [`MAX_SEGMENT_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(PacketError::Oversized(self.payload.len()));
        }

        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[OFF_TYPE] = self.kind as u8;
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if `buf` is shorter than [`HEADER_LEN`], longer than
    /// [`MAX_SEGMENT_SIZE`], or carries an unknown type byte.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }
        if buf.len() > MAX_SEGMENT_SIZE {
            return Err(PacketError::Oversized(buf.len() - HEADER_LEN));
        }

        let kind = SegmentType::try_from(buf[OFF_TYPE])?;
        let seq = read_u32(&buf[OFF_SEQ..OFF_SEQ + 4]);
        let ack = read_u32(&buf[OFF_ACK..OFF_ACK + 4]);

        Ok(Segment {
            kind,
            seq,
            ack,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq={} ack={}", self.kind, self.seq, self.ack)?;
        if !self.payload.is_empty() {
            write!(f, " len={}", self.payload.len())?;
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_be_bytes(word)
}

/// Errors that can arise when building or parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes is too short to contain a header")]
    BufferTooShort(usize),
    #[error("unknown segment type {0}")]
    UnknownType(u8),
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte maximum")]
    Oversized(usize),
}
