//! Wire frame
//!
//! A frame is a fixed 18 byte big-endian header followed by an opaque body:
//!
//! ```text
//! | header len: u16 | version: u16 | operation: u32 | sequence: u32 |
//! | compress: u8 | content type: u8 | body len: u32 | body ... |
//! ```

use super::Operation;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

const HEADER_LEN_SIZE: usize = 2;
const VERSION_SIZE: usize = 2;
const OPERATION_SIZE: usize = 4;
const SEQUENCE_SIZE: usize = 4;
const COMPRESS_SIZE: usize = 1;
const CONTENT_TYPE_SIZE: usize = 1;
const BODY_LEN_SIZE: usize = 4;

/// Size of the fixed header
pub const HEADER_LEN: usize = HEADER_LEN_SIZE
    + VERSION_SIZE
    + OPERATION_SIZE
    + SEQUENCE_SIZE
    + COMPRESS_SIZE
    + CONTENT_TYPE_SIZE
    + BODY_LEN_SIZE;

/// Protocol version stamped on server-built frames
pub const PROTOCOL_VERSION: i16 = 1;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Header length field does not match the fixed header size
    #[error("invalid header length: {0}")]
    InvalidHeaderLength(u16),

    /// Body length exceeds the configured limit
    #[error("body length {len} out of range (limit {limit})")]
    BodyOutOfRange { len: usize, limit: usize },

    /// Frame is structurally valid but its contents are not
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the error came from the socket rather than the peer's bytes
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub version: i16,
    pub operation: i32,
    pub sequence: i32,
    pub compress: i8,
    pub content_type: i8,
    pub body_len: u32,
}

impl Header {
    /// Parse a header from at least [`HEADER_LEN`] bytes
    pub fn decode(mut src: &[u8]) -> Result<Self, FrameError> {
        if src.len() < HEADER_LEN {
            return Err(FrameError::InvalidFrame(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                src.len()
            )));
        }
        let header_len = src.get_u16();
        if usize::from(header_len) != HEADER_LEN {
            return Err(FrameError::InvalidHeaderLength(header_len));
        }
        Ok(Self {
            version: src.get_i16(),
            operation: src.get_i32(),
            sequence: src.get_i32(),
            compress: src.get_i8(),
            content_type: src.get_i8(),
            body_len: src.get_u32(),
        })
    }

    /// Append the encoded header
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(HEADER_LEN as u16);
        dst.put_i16(self.version);
        dst.put_i32(self.operation);
        dst.put_i32(self.sequence);
        dst.put_i8(self.compress);
        dst.put_i8(self.content_type);
        dst.put_u32(self.body_len);
    }

    /// Attach a body, producing a frame
    #[must_use]
    pub fn into_frame(self, body: Bytes) -> Frame {
        Frame {
            version: self.version,
            operation: self.operation,
            sequence: self.sequence,
            compress: self.compress,
            content_type: self.content_type,
            body,
        }
    }
}

/// One wire-level message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub version: i16,
    pub operation: i32,
    pub sequence: i32,
    pub compress: i8,
    pub content_type: i8,
    pub body: Bytes,
}

impl Frame {
    /// Create a frame for an operation with the current protocol version
    pub fn new(operation: impl Into<i32>, body: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            operation: operation.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: i8) -> Self {
        self.content_type = content_type;
        self
    }

    /// Header describing this frame's current body
    #[must_use]
    pub fn header(&self) -> Header {
        Header {
            version: self.version,
            operation: self.operation,
            sequence: self.sequence,
            compress: self.compress,
            content_type: self.content_type,
            body_len: self.body.len() as u32,
        }
    }

    /// Reserved operation of this frame, if any
    #[must_use]
    pub fn reserved_op(&self) -> Option<Operation> {
        Operation::from_i32(self.operation)
    }

    #[must_use]
    pub fn is(&self, op: Operation) -> bool {
        self.operation == op.as_i32()
    }

    /// Turn a request into its reply in place, keeping version and sequence
    pub fn reply_in_place(&mut self, op: Operation, body: Bytes) {
        self.operation = op.as_i32();
        self.body = body;
    }

    /// Encoded length on the wire
    #[must_use]
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_header_len_is_eighteen() {
        assert_eq!(HEADER_LEN, 18);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let frame = Frame::new(Operation::Auth, Bytes::from_static(b"hi")).with_sequence(0x0102_0304);
        let mut buf = BytesMut::new();
        frame.header().encode(&mut buf);

        assert_eq!(
            &buf[..],
            &[0, 18, 0, 1, 0, 0, 0, 7, 1, 2, 3, 4, 0, 0, 0, 0, 0, 2][..]
        );
    }

    #[test]
    fn test_header_rejects_wrong_length_field() {
        let mut buf = BytesMut::new();
        Frame::new(Operation::Heartbeat, Bytes::new()).header().encode(&mut buf);
        buf[1] = 20;

        let err = Header::decode(&buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidHeaderLength(20)));
    }

    #[test]
    fn test_header_rejects_short_input() {
        let err = Header::decode(&[0, 18, 0]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame(_)));
    }

    #[test]
    fn test_reply_in_place_keeps_sequence() {
        let mut frame = Frame::new(Operation::Heartbeat, Bytes::from_static(b"ping")).with_sequence(9);
        frame.reply_in_place(Operation::HeartbeatReply, Bytes::new());

        assert!(frame.is(Operation::HeartbeatReply));
        assert_eq!(frame.sequence, 9);
        assert!(frame.body.is_empty());
        assert_eq!(frame.wire_len(), HEADER_LEN);
    }
}
