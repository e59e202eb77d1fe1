//! Cross-node envelope carried by the message broker

use super::frame::{Frame, FrameError, Header, HEADER_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A frame addressed to a user key, possibly connected to another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMessage {
    /// Member id of the sender, 0 for server-originated messages
    pub sender: i64,
    /// Key of the receiving connection
    pub receiver: String,
    /// Unix milliseconds at creation
    pub timestamp: i64,
    pub frame: Frame,
}

impl InternalMessage {
    pub fn new(sender: i64, receiver: impl Into<String>, frame: Frame) -> Self {
        Self {
            sender,
            receiver: receiver.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            frame,
        }
    }

    /// Binary layout: frame header, sender, timestamp, receiver length,
    /// receiver, frame body
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let receiver = self.receiver.as_bytes();
        let receiver_len = u16::try_from(receiver.len()).map_err(|_| {
            FrameError::InvalidFrame(format!("receiver key too long: {}", receiver.len()))
        })?;

        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + 8 + 8 + 2 + receiver.len() + self.frame.body.len());
        self.frame.header().encode(&mut buf);
        buf.put_i64(self.sender);
        buf.put_i64(self.timestamp);
        buf.put_u16(receiver_len);
        buf.put_slice(receiver);
        buf.put_slice(&self.frame.body);
        Ok(buf.freeze())
    }

    pub fn decode(mut src: Bytes) -> Result<Self, FrameError> {
        let header = Header::decode(&src)?;
        src.advance(HEADER_LEN);

        if src.remaining() < 18 {
            return Err(FrameError::InvalidFrame("truncated envelope".to_string()));
        }
        let sender = src.get_i64();
        let timestamp = src.get_i64();
        let receiver_len = usize::from(src.get_u16());

        let body_len = header.body_len as usize;
        if src.remaining() != receiver_len + body_len {
            return Err(FrameError::InvalidFrame(format!(
                "envelope length mismatch: expected {}, got {}",
                receiver_len + body_len,
                src.remaining()
            )));
        }

        let receiver = String::from_utf8(src.split_to(receiver_len).to_vec())
            .map_err(|e| FrameError::InvalidFrame(format!("receiver key: {e}")))?;

        Ok(Self {
            sender,
            receiver,
            timestamp,
            frame: header.into_frame(src),
        })
    }
}
