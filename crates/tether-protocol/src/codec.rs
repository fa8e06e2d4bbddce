//! Streaming frame codec for `tokio_util::codec::Framed`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameType, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::message::Message;

/// Length-prefixed frame codec.
///
/// Yields complete frames in arrival order however the byte stream is
/// fragmented. Frames with unknown type tags are consumed and skipped.
///
/// An oversized length header produces a single
/// [`ProtocolError::FrameTooLarge`]; the codec then discards the declared
/// payload bytes as they arrive, so a caller that keeps decoding resumes at
/// the next frame boundary.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Payload bytes of a rejected frame still to discard.
    skip: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn discard_pending(&mut self, src: &mut BytesMut) {
        let n = self.skip.min(src.len());
        src.advance(n);
        self.skip -= n;
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if self.skip > 0 {
                self.discard_pending(src);
                if self.skip > 0 {
                    return Ok(None);
                }
            }

            let Some(header) = src.get(..HEADER_LEN) else {
                return Ok(None);
            };
            let tag = header.first().copied().unwrap_or_default();
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(header.get(1..HEADER_LEN).unwrap_or(&[0; 4]));
            let len = u32::from_be_bytes(len_bytes) as usize;

            if len > MAX_PAYLOAD_LEN {
                warn!(tag, len, max = MAX_PAYLOAD_LEN, "rejecting oversized frame");
                src.advance(HEADER_LEN);
                self.skip = len;
                return Err(ProtocolError::FrameTooLarge {
                    len,
                    max: MAX_PAYLOAD_LEN,
                });
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();

            match FrameType::from_u8(tag) {
                Some(frame_type) => return Ok(Some(Frame { frame_type, payload })),
                None => {
                    trace!(tag, len, "skipping unknown frame type");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        frame.write_to(dst)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        msg.to_frame()?.write_to(dst)
    }
}
