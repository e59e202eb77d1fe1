//! Cross-node delivery
//!
//! A broker knows which node each connection key lives on. Messages for a
//! key that is not connected locally are sent through it, and every node
//! drains its own inbox with [`MessageBroker::receive`].

mod local;
mod pool;
mod redis;

pub use local::{LocalBroker, LocalHub};
pub use pool::RedisPool;
pub use redis::{node_channel, route_key, RedisBroker};

use crate::protocol::{FrameError, InternalMessage};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// No node has registered the key
    #[error("no route for key {0}")]
    NoRoute(String),

    #[error("broker closed")]
    Closed,

    #[error("encoding error: {0}")]
    Encode(#[from] FrameError),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("connection error: {0}")]
    Connection(String),
}

impl BrokerError {
    /// Whether retrying may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Pool(_) | Self::Connection(_))
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Register `key` as connected to this node
    async fn subscribe(&self, key: &str) -> Result<(), BrokerError>;

    /// Drop the route for `key` if it still points at this node
    async fn unsubscribe(&self, key: &str) -> Result<(), BrokerError>;

    /// Deliver a message to the node holding its receiver key
    async fn send(&self, msg: InternalMessage) -> Result<(), BrokerError>;

    /// Next message addressed to this node; `None` once closed
    async fn receive(&self) -> Result<Option<InternalMessage>, BrokerError>;

    /// Stop receiving
    async fn close(&self) -> Result<(), BrokerError>;
}
