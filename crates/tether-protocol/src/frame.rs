//! Frame types and the raw frame encoder.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::ProtocolError;

/// Size of the `[type][length]` header.
pub const HEADER_LEN: usize = 5;

/// Largest payload a frame may carry (16 MiB).
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Frame type tag, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Client -> daemon, opens the handshake
    Hello = 0x01,
    /// Daemon -> client, completes the handshake
    Welcome = 0x02,
    /// Terminal bytes in either direction
    Data = 0x03,
    Resize = 0x04,
    Signal = 0x05,
    /// Daemon -> client, the foreground process ended
    Exit = 0x06,
    /// Daemon -> client, buffered output sent right after WELCOME
    Replay = 0x07,
    Ping = 0x08,
    Pong = 0x09,
    /// Client -> daemon, replace the foreground process
    Spawn = 0x0A,
}

impl FrameType {
    /// All known frame types, in tag order.
    pub const ALL: [FrameType; 10] = [
        Self::Hello,
        Self::Welcome,
        Self::Data,
        Self::Resize,
        Self::Signal,
        Self::Exit,
        Self::Replay,
        Self::Ping,
        Self::Pong,
        Self::Spawn,
    ];

    /// Maps a wire tag to a frame type; unknown tags yield `None`.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u8 == tag)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if the payload is JSON rather than raw bytes.
    pub fn is_control(self) -> bool {
        !matches!(self, Self::Data | Self::Replay | Self::Ping | Self::Pong)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Welcome => "WELCOME",
            Self::Data => "DATA",
            Self::Resize => "RESIZE",
            Self::Signal => "SIGNAL",
            Self::Exit => "EXIT",
            Self::Replay => "REPLAY",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Spawn => "SPAWN",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Appends the wire form of this frame to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.payload.len();
        let wire_len = u32::try_from(len)
            .ok()
            .filter(|_| len <= MAX_PAYLOAD_LEN)
            .ok_or(ProtocolError::FrameTooLarge {
                len,
                max: MAX_PAYLOAD_LEN,
            })?;

        dst.reserve(HEADER_LEN + len);
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u32(wire_len);
        dst.put_slice(&self.payload);
        Ok(())
    }
}

/// Encodes a single frame into a standalone buffer.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    Frame::new(frame_type, Bytes::copy_from_slice(payload)).write_to(&mut buf)?;
    Ok(buf.freeze())
}
