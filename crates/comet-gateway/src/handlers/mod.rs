//! Business hooks
//!
//! The gateway owns framing, rooms and delivery; everything that depends on
//! what a frame means is delegated to a [`Handler`].

mod error;
mod identify;

pub use error::{HandlerError, HandlerResult};
pub use identify::{IdentifyHandler, IdentifyRequest};

use crate::connection::Channel;
use crate::protocol::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// Identity established by a successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    /// Member id
    pub mid: i64,
    /// Connection key, unique per live connection
    pub key: String,
    /// Room to join, empty for none
    pub room_id: String,
    /// Operations the connection receives broadcasts for
    pub accepts: Vec<i32>,
    /// Expected interval between client heartbeats
    pub heartbeat: Duration,
    /// Body of the auth reply frame
    pub body: Bytes,
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Validate the first frame of a connection
    async fn authenticate(&self, channel: &Channel, frame: &Frame) -> HandlerResult<AuthReply>;

    /// Handle a business frame. The frame is written back to the client
    /// after this returns, so replies are made by rewriting it in place.
    async fn handle_frame(&self, channel: &Channel, frame: &mut Frame) -> HandlerResult<()>;

    /// Called once after an authenticated connection is torn down
    async fn handle_closed(&self, channel: &Channel);

    /// Report this node's room counts and get back cluster-wide counts
    async fn renew_online_count(
        &self,
        counts: HashMap<String, i32>,
    ) -> HandlerResult<HashMap<String, i32>>;
}
