//! Protocol error types.

use thiserror::Error;

use crate::frame::FrameType;

/// Errors raised while framing or interpreting protocol messages.
///
/// All of these are local to a single connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Declared payload length exceeds [`crate::MAX_PAYLOAD_LEN`]
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// A control frame's JSON payload could not be parsed or produced
    #[error("Invalid {frame_type} payload: {source}")]
    InvalidPayload {
        frame_type: FrameType,
        #[source]
        source: serde_json::Error,
    },

    /// A SIGNAL frame named a signal outside the allow-list
    #[error("Signal {0} is not allowed")]
    SignalNotAllowed(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

