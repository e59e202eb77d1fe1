//! Header and body construction per operation code
//!
//! The gateway never inspects business bodies. The few operations it does
//! interpret are registered here in a static table, and embedders can add
//! their own decoders before the server starts.

use super::frame::{Frame, FrameError, Header, PROTOCOL_VERSION};
use super::Operation;
use bytes::Bytes;
use std::collections::HashMap;

/// Typed view of a frame body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opaque bytes
    Raw(Bytes),
    /// UTF-8 text
    Text(String),
    /// JSON document
    Json(serde_json::Value),
    /// Comma separated operation codes
    Ops(Vec<i32>),
}

impl Payload {
    /// Encode back into a frame body
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let bytes = match self {
            Self::Raw(b) => b.clone(),
            Self::Text(s) => Bytes::from(s.clone()),
            Self::Json(v) => serde_json::to_vec(v)
                .map(Bytes::from)
                .map_err(|e| FrameError::InvalidFrame(e.to_string()))?,
            Self::Ops(ops) => Bytes::from(
                ops.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        };
        Ok(bytes)
    }
}

/// Body constructor for one operation code
pub type BodyDecoder = fn(&Bytes) -> Result<Payload, FrameError>;

#[derive(Clone, Copy)]
struct Entry {
    name: &'static str,
    decode: BodyDecoder,
}

/// Command code to body constructor table
#[derive(Clone)]
pub struct DataCreator {
    entries: HashMap<i32, Entry>,
}

impl std::fmt::Debug for DataCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ops: Vec<_> = self.entries.keys().copied().collect();
        ops.sort_unstable();
        f.debug_struct("DataCreator").field("ops", &ops).finish()
    }
}

impl Default for DataCreator {
    fn default() -> Self {
        Self::new()
            .with(Operation::Auth, "auth", decode_json)
            .with(Operation::ChangeRoom, "change_room", decode_text)
            .with(Operation::Sub, "sub", decode_ops)
            .with(Operation::Unsub, "unsub", decode_ops)
            .with(Operation::Raw, "raw", decode_raw)
    }
}

impl DataCreator {
    /// Empty table; unknown operations decode as raw bytes
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a decoder, replacing any existing one for the code
    #[must_use]
    pub fn with(mut self, op: impl Into<i32>, name: &'static str, decode: BodyDecoder) -> Self {
        self.entries.insert(op.into(), Entry { name, decode });
        self
    }

    /// Fresh header for a server-built frame
    #[must_use]
    pub fn create_header(&self, op: impl Into<i32>) -> Header {
        Header {
            version: PROTOCOL_VERSION,
            operation: op.into(),
            ..Header::default()
        }
    }

    /// Decode the body of `frame` with the constructor for its operation
    pub fn create_body(&self, frame: &Frame) -> Result<Payload, FrameError> {
        match self.entries.get(&frame.operation) {
            Some(entry) => (entry.decode)(&frame.body),
            None => decode_raw(&frame.body),
        }
    }

    /// Build a complete frame for an operation and payload
    pub fn create_frame(&self, op: impl Into<i32>, payload: &Payload) -> Result<Frame, FrameError> {
        Ok(self.create_header(op).into_frame(payload.to_bytes()?))
    }

    /// Registered name of an operation
    #[must_use]
    pub fn name(&self, op: i32) -> Option<&'static str> {
        self.entries.get(&op).map(|e| e.name)
    }

    #[must_use]
    pub fn contains(&self, op: i32) -> bool {
        self.entries.contains_key(&op)
    }
}

pub fn decode_raw(body: &Bytes) -> Result<Payload, FrameError> {
    Ok(Payload::Raw(body.clone()))
}

pub fn decode_text(body: &Bytes) -> Result<Payload, FrameError> {
    std::str::from_utf8(body)
        .map(|s| Payload::Text(s.trim().to_string()))
        .map_err(|e| FrameError::InvalidFrame(format!("body is not utf-8: {e}")))
}

pub fn decode_json(body: &Bytes) -> Result<Payload, FrameError> {
    serde_json::from_slice(body)
        .map(Payload::Json)
        .map_err(|e| FrameError::InvalidFrame(format!("body is not json: {e}")))
}

pub fn decode_ops(body: &Bytes) -> Result<Payload, FrameError> {
    let Payload::Text(text) = decode_text(body)? else {
        return Err(FrameError::InvalidFrame("op list".to_string()));
    };
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i32>()
                .map_err(|_| FrameError::InvalidFrame(format!("invalid operation code: {s}")))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Payload::Ops)
}
