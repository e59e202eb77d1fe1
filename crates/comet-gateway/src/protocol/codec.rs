//! Frame codec
//!
//! Length-checked framing on top of `tokio-util`. The pumps drive the
//! codec by hand over pooled buffers; clients can wrap a socket in
//! `Framed<_, FrameCodec>`.

use super::frame::{Frame, FrameError, Header, HEADER_LEN};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default largest body accepted from a peer
pub const DEFAULT_READ_LIMIT: usize = 1 << 12;

/// Default largest body written to a peer
pub const DEFAULT_WRITE_LIMIT: usize = 1 << 22;

/// Frame codec with separate read and write body limits
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    read_limit: usize,
    write_limit: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_READ_LIMIT, DEFAULT_WRITE_LIMIT)
    }
}

impl FrameCodec {
    #[must_use]
    pub const fn new(read_limit: usize, write_limit: usize) -> Self {
        Self {
            read_limit,
            write_limit,
        }
    }

    #[must_use]
    pub const fn read_limit(&self) -> usize {
        self.read_limit
    }

    #[must_use]
    pub const fn write_limit(&self) -> usize {
        self.write_limit
    }

    /// Append one encoded frame to `dst`
    pub fn encode_frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.body.len();
        if len > self.write_limit {
            return Err(FrameError::BodyOutOfRange {
                len,
                limit: self.write_limit,
            });
        }
        dst.reserve(HEADER_LEN + len);
        frame.header().encode(dst);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }

    /// Split one complete frame off the front of `src`, if there is one
    pub fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = Header::decode(&src[..HEADER_LEN])?;
        let body_len = header.body_len as usize;
        if body_len > self.read_limit {
            return Err(FrameError::BodyOutOfRange {
                len: body_len,
                limit: self.read_limit,
            });
        }

        let total = HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        Ok(Some(header.into_frame(body)))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        self.decode_frame(src)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.encode_frame(frame, dst)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.encode_frame(&frame, dst)
    }
}
