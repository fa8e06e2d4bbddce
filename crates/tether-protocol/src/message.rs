//! Typed protocol messages.
//!
//! [`Message`] is the typed view of a [`Frame`]. Control frames carry
//! camelCase JSON payloads; DATA, REPLAY, PING and PONG carry raw bytes.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameType};
use crate::version::ProtocolVersion;

// ============================================================================
// Control payloads
// ============================================================================

/// First frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub protocol_version: ProtocolVersion,
}

impl Default for Hello {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}

/// Daemon's answer to HELLO: its identity and the terminal size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub protocol_version: ProtocolVersion,
    /// Daemon pid
    pub pid: u32,
    /// Daemon start time (clock ticks since boot)
    pub start_time: u64,
    /// Pid of the process running on the pty, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

/// Signals a client may deliver to the foreground process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hup,
    Int,
    Kill,
    Term,
    Winch,
}

impl Signal {
    /// Host signal number. Client and daemon share a machine, so the wire
    /// carries the local numbering.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Kill => libc::SIGKILL,
            Self::Term => libc::SIGTERM,
            Self::Winch => libc::SIGWINCH,
        }
    }

    /// Maps a signal number onto the allow-list.
    pub fn from_raw(signal: i32) -> Option<Self> {
        match signal {
            libc::SIGHUP => Some(Self::Hup),
            libc::SIGINT => Some(Self::Int),
            libc::SIGKILL => Some(Self::Kill),
            libc::SIGTERM => Some(Self::Term),
            libc::SIGWINCH => Some(Self::Winch),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hup => "SIGHUP",
            Self::Int => "SIGINT",
            Self::Kill => "SIGKILL",
            Self::Term => "SIGTERM",
            Self::Winch => "SIGWINCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    pub signal: i32,
}

impl SignalRequest {
    pub fn new(signal: Signal) -> Self {
        Self {
            signal: signal.as_raw(),
        }
    }

    /// Returns the requested signal if it is on the allow-list.
    pub fn validate(&self) -> Result<Signal, ProtocolError> {
        Signal::from_raw(self.signal).ok_or(ProtocolError::SignalNotAllowed(self.signal))
    }
}

/// How the foreground process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

/// Replace the foreground process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spawn {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// ============================================================================
// Message
// ============================================================================

/// Every message that can cross the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Data(Bytes),
    Resize(Resize),
    Signal(SignalRequest),
    Exit(Exit),
    Replay(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Spawn(Spawn),
}

impl Message {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Hello(_) => FrameType::Hello,
            Self::Welcome(_) => FrameType::Welcome,
            Self::Data(_) => FrameType::Data,
            Self::Resize(_) => FrameType::Resize,
            Self::Signal(_) => FrameType::Signal,
            Self::Exit(_) => FrameType::Exit,
            Self::Replay(_) => FrameType::Replay,
            Self::Ping(_) => FrameType::Ping,
            Self::Pong(_) => FrameType::Pong,
            Self::Spawn(_) => FrameType::Spawn,
        }
    }

    /// Serializes this message into a frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let frame_type = self.frame_type();
        let payload = match self {
            Self::Data(b) | Self::Replay(b) | Self::Ping(b) | Self::Pong(b) => b.clone(),
            Self::Hello(m) => to_json(frame_type, m)?,
            Self::Welcome(m) => to_json(frame_type, m)?,
            Self::Resize(m) => to_json(frame_type, m)?,
            Self::Signal(m) => to_json(frame_type, m)?,
            Self::Exit(m) => to_json(frame_type, m)?,
            Self::Spawn(m) => to_json(frame_type, m)?,
        };
        Ok(Frame {
            frame_type,
            payload,
        })
    }

    /// Parses a frame. Malformed JSON yields [`ProtocolError::InvalidPayload`].
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame {
            frame_type,
            payload,
        } = frame;
        Ok(match frame_type {
            FrameType::Data => Self::Data(payload),
            FrameType::Replay => Self::Replay(payload),
            FrameType::Ping => Self::Ping(payload),
            FrameType::Pong => Self::Pong(payload),
            FrameType::Hello => Self::Hello(from_json(frame_type, &payload)?),
            FrameType::Welcome => Self::Welcome(from_json(frame_type, &payload)?),
            FrameType::Resize => Self::Resize(from_json(frame_type, &payload)?),
            FrameType::Signal => Self::Signal(from_json(frame_type, &payload)?),
            FrameType::Exit => Self::Exit(from_json(frame_type, &payload)?),
            FrameType::Spawn => Self::Spawn(from_json(frame_type, &payload)?),
        })
    }
}

impl TryFrom<Frame> for Message {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        Self::from_frame(frame)
    }
}

fn to_json<T: Serialize>(frame_type: FrameType, value: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| ProtocolError::InvalidPayload { frame_type, source })
}

fn from_json<T: DeserializeOwned>(frame_type: FrameType, payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|source| ProtocolError::InvalidPayload { frame_type, source })
}
