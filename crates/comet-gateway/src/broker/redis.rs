//! Redis-backed broker
//!
//! Routes are plain keys (`comet:route:{key}` holding a node id) that expire
//! unless renewed, so routes of a node that died go away on their own. Each
//! node subscribes to its own pub/sub channel (`comet:node:{id}`) and
//! receives binary [`InternalMessage`]s on it.

use super::pool::{redact, RedisPool};
use super::{BrokerError, MessageBroker};
use crate::protocol::InternalMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use ::redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const INBOX_SIZE: usize = 1024;

/// Route lifetime when none is configured: three times the default maximum
/// heartbeat
pub const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(3 * 600);

/// Deletes the route only while it still names this node
const RELEASE_ROUTE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

pub fn route_key(key: &str) -> String {
    format!("comet:route:{key}")
}

pub fn node_channel(node_id: &str) -> String {
    format!("comet:node:{node_id}")
}

/// Whole seconds for `SET .. EX`, at least one
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

pub struct RedisBroker {
    pool: RedisPool,
    node_id: String,
    route_ttl: Duration,
    inbox: Mutex<mpsc::Receiver<InternalMessage>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("node_id", &self.node_id)
            .field("route_ttl", &self.route_ttl)
            .field("pool", &self.pool)
            .finish()
    }
}

impl RedisBroker {
    /// Connect, verify Redis answers, and start listening on this node's
    /// channel
    pub async fn connect(
        config: &comet_common::RedisConfig,
        node_id: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let node_id = node_id.into();
        let pool = RedisPool::from_config(config)?;
        pool.health_check().await?;

        let (tx, rx) = mpsc::channel(INBOX_SIZE);
        let cancel = CancellationToken::new();
        tokio::spawn(listener_loop(
            config.url.clone(),
            node_channel(&node_id),
            Duration::from_millis(config.reconnect_delay_ms),
            tx,
            cancel.clone(),
        ));

        tracing::info!(node_id = %node_id, "Redis broker connected");
        Ok(Self {
            pool,
            node_id,
            route_ttl: DEFAULT_ROUTE_TTL,
            inbox: Mutex::new(rx),
            cancel,
        })
    }

    /// How long a route lives without renewal. Should comfortably exceed
    /// the interval at which heartbeating connections renew their routes.
    #[must_use]
    pub fn with_route_ttl(mut self, ttl: Duration) -> Self {
        self.route_ttl = ttl;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn route_ttl(&self) -> Duration {
        self.route_ttl
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn subscribe(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(route_key(key), &self.node_id, ttl_secs(self.route_ttl))
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        let released: i64 = ::redis::Script::new(RELEASE_ROUTE)
            .key(route_key(key))
            .arg(&self.node_id)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            tracing::trace!(key = %key, "Route already owned by another node");
        }
        Ok(())
    }

    async fn send(&self, msg: InternalMessage) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        let node: Option<String> = conn.get(route_key(&msg.receiver)).await?;
        let node = node.ok_or_else(|| BrokerError::NoRoute(msg.receiver.clone()))?;

        let payload = msg.encode()?;
        let receivers: i64 = conn.publish(node_channel(&node), payload.as_ref()).await?;
        if receivers == 0 {
            tracing::debug!(node_id = %node, key = %msg.receiver, "Node not listening");
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<InternalMessage>, BrokerError> {
        Ok(self.inbox.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keep a subscription alive until cancelled, reconnecting after errors
async fn listener_loop(
    url: String,
    channel: String,
    reconnect_delay: Duration,
    inbox: mpsc::Sender<InternalMessage>,
    cancel: CancellationToken,
) {
    loop {
        match run_listener(&url, &channel, &inbox, &cancel).await {
            Ok(()) => break,
            Err(e) => {
                tracing::error!(url = %redact(&url), error = %e, "Subscriber error, reconnecting...");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }
    tracing::info!(channel = %channel, "Subscriber shutting down");
}

/// Returns `Ok` when cancelled or when nobody reads the inbox anymore
async fn run_listener(
    url: &str,
    channel: &str,
    inbox: &mpsc::Sender<InternalMessage>,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    let client = ::redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!(channel = %channel, "Subscriber connected to Redis");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Err(BrokerError::Connection("pub/sub stream ended".to_string()));
                };
                let payload: Vec<u8> = msg.get_payload()?;
                match InternalMessage::decode(Bytes::from(payload)) {
                    Ok(message) => {
                        if inbox.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping malformed broker message"),
                }
            }
        }
    }
}
