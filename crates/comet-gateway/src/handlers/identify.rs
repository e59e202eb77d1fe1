//! JSON identify handler
//!
//! Accepts any client that names a positive member id. Used by the binary
//! and the integration tests.

use super::{AuthReply, Handler, HandlerError, HandlerResult};
use crate::connection::Channel;
use crate::protocol::{DataCreator, Frame, Operation, Payload};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Body of the auth frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifyRequest {
    pub mid: i64,
    /// Connection key; generated when empty
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub accepts: Vec<i32>,
    /// Heartbeat interval in seconds; 0 uses the handler default
    #[serde(default)]
    pub heartbeat: u64,
}

#[derive(Debug, Clone)]
pub struct IdentifyHandler {
    creator: DataCreator,
    default_heartbeat: Duration,
}

impl Default for IdentifyHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(240))
    }
}

impl IdentifyHandler {
    #[must_use]
    pub fn new(default_heartbeat: Duration) -> Self {
        Self {
            creator: DataCreator::default(),
            default_heartbeat,
        }
    }

    fn parse(&self, frame: &Frame) -> HandlerResult<IdentifyRequest> {
        match self.creator.create_body(frame)? {
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
            other => Err(HandlerError::InvalidBody(format!(
                "expected json auth body, got {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl Handler for IdentifyHandler {
    async fn authenticate(&self, channel: &Channel, frame: &Frame) -> HandlerResult<AuthReply> {
        let request = self.parse(frame)?;
        if request.mid <= 0 {
            return Err(HandlerError::Unauthorized(format!(
                "invalid member id {}",
                request.mid
            )));
        }

        let key = if request.key.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            request.key
        };
        let heartbeat = match request.heartbeat {
            0 => self.default_heartbeat,
            secs => Duration::from_secs(secs),
        };

        tracing::debug!(
            mid = request.mid,
            key = %key,
            ip = %channel.ip(),
            room_id = %request.room_id,
            "Client identified"
        );

        let body = serde_json::to_vec(&serde_json::json!({ "key": key }))?;
        Ok(AuthReply {
            mid: request.mid,
            key,
            room_id: request.room_id,
            accepts: request.accepts,
            heartbeat,
            body: Bytes::from(body),
        })
    }

    async fn handle_frame(&self, channel: &Channel, frame: &mut Frame) -> HandlerResult<()> {
        if frame.is(Operation::SendMsg) {
            let body = frame.body.clone();
            frame.reply_in_place(Operation::SendMsgReply, body);
        }
        tracing::trace!(key = %channel.key(), op = frame.operation, "Frame handled");
        Ok(())
    }

    async fn handle_closed(&self, channel: &Channel) {
        tracing::debug!(key = %channel.key(), mid = channel.mid(), "Client gone");
    }

    async fn renew_online_count(
        &self,
        counts: HashMap<String, i32>,
    ) -> HandlerResult<HashMap<String, i32>> {
        Ok(counts)
    }
}
