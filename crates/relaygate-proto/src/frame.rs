//! Relay frame codec
//!
//! ```text
//! +------+-------+-----------+--------------+---------+
//! | type | flags | ack (u64) | offset (u64) | payload |
//! +------+-------+-----------+--------------+---------+
//! ```
//!
//! `ack` is always the number of bytes the sender has delivered to its
//! consumer from the peer's stream. `offset` is the stream position of the
//! first payload byte (`Data`) or the final stream length (`Fin`).

use crate::messages::ControlMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Control = 0,
    Data = 1,
    Fin = 2,
    Ack = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Fin),
            3 => Ok(FrameType::Ack),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// On an `Ack`: the peer's end of stream has been delivered
    pub const FIN: u8 = 0b0000_0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A single relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub ack: u64,
    pub offset: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: type (1) + flags (1) + ack (8) + offset (8) = 18 bytes
    pub const HEADER_SIZE: usize = 18;

    pub fn new(frame_type: FrameType, ack: u64, offset: u64, payload: Bytes) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::new(),
            ack,
            offset,
            payload,
        }
    }

    pub fn data(ack: u64, offset: u64, payload: Bytes) -> Self {
        Self::new(FrameType::Data, ack, offset, payload)
    }

    pub fn fin(ack: u64, length: u64) -> Self {
        Self::new(FrameType::Fin, ack, length, Bytes::new())
    }

    pub fn ack(ack: u64, fin_delivered: bool) -> Self {
        let mut frame = Self::new(FrameType::Ack, ack, 0, Bytes::new());
        if fin_delivered {
            frame.flags = frame.flags.with_fin();
        }
        frame
    }

    pub fn control(message: &ControlMessage) -> Result<Self, FrameError> {
        let payload = bincode::serialize(message)
            .map_err(|e| FrameError::Serialization(e.to_string()))?;
        Ok(Self::new(FrameType::Control, 0, 0, Bytes::from(payload)))
    }

    /// Decode the control message carried by a `Control` frame
    pub fn control_message(&self) -> Result<ControlMessage, FrameError> {
        if self.frame_type != FrameType::Control {
            return Err(FrameError::UnexpectedFrame(self.frame_type));
        }
        bincode::deserialize(&self.payload).map_err(|e| FrameError::Serialization(e.to_string()))
    }

    /// Offset one past the last payload byte, `None` if it overflows
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.payload.len() as u64)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_PAYLOAD {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u64(self.ack);
        buf.put_u64(self.offset);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::IncompleteFrame(buf.len()));
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let ack = buf.get_u64();
        let offset = buf.get_u64();

        if buf.len() > crate::MAX_PAYLOAD {
            return Err(FrameError::FrameTooLarge(buf.len()));
        }
        if frame_type != FrameType::Control && frame_type != FrameType::Data && !buf.is_empty() {
            return Err(FrameError::UnexpectedPayload(frame_type));
        }
        let frame = Self {
            frame_type,
            flags,
            ack,
            offset,
            payload: buf,
        };
        if frame.end().is_none() {
            return Err(FrameError::OffsetOverflow);
        }
        Ok(frame)
    }
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame: {0} bytes")]
    IncompleteFrame(usize),

    #[error("Unexpected payload on {0:?} frame")]
    UnexpectedPayload(FrameType),

    #[error("Unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),

    #[error("Frame offset overflows the stream")]
    OffsetOverflow,

    #[error("Serialization error: {0}")]
    Serialization(String),
}
