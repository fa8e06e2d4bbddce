//! tether Protocol - Wire protocol between supervisors and session daemons
//!
//! Every message travels as a length-prefixed binary frame:
//!
//! ```text
//! +--------+----------------+-------------------+
//! | type:1 | length:4 (BE)  | payload: length   |
//! +--------+----------------+-------------------+
//! ```
//!
//! DATA, REPLAY, PING and PONG payloads are raw bytes. Every other frame
//! carries a camelCase JSON object (see [`message`]).

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod version;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{encode_frame, Frame, FrameType, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use message::{Exit, Hello, Message, Resize, Signal, SignalRequest, Spawn, Welcome};
pub use version::{ProtocolVersion, VersionError};
