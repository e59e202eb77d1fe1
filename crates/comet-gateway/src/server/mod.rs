//! Comet server
//!
//! Owns the listeners, the buckets every authenticated connection lives in,
//! the round of timers and buffer pools, and the optional broker that links
//! this node to the rest of the cluster.

mod accept;
mod backoff;
mod config;
mod conn;
mod dispatch;

pub use backoff::Backoff;
pub use config::{ServerConfig, TcpOptions};

use crate::broadcast::{Bucket, RoomMessage};
use crate::broker::{BrokerError, MessageBroker};
use crate::connection::ChannelError;
use crate::handlers::{Handler, HandlerError};
use crate::protocol::{DataCreator, Frame, FrameCodec, InternalMessage};
use crate::round::Round;
use comet_common::AppError;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("no connection for key {0}")]
    NotFound(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl From<ServerError> for AppError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Bind { addr, source } => AppError::bind(addr, source),
            ServerError::Broker(e) => AppError::broker(e),
            other => AppError::internal(other),
        }
    }
}

/// State shared by the accept loops and every connection task
pub(crate) struct Shared {
    config: ServerConfig,
    buckets: Vec<Arc<Bucket>>,
    round: Round,
    handler: Arc<dyn Handler>,
    broker: Option<Arc<dyn MessageBroker>>,
    creator: DataCreator,
    codec: FrameCodec,
    permits: Arc<Semaphore>,
    /// Accept counter, picks the round shard of each connection
    accepted: AtomicUsize,
    shutdown: CancellationToken,
}

impl Shared {
    fn bucket(&self, key: &str) -> &Arc<Bucket> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.buckets.len() as u64) as usize;
        &self.buckets[idx]
    }

    /// Hand a frame to a locally connected key
    fn push_local(&self, key: &str, frame: Frame) -> Option<Result<(), ChannelError>> {
        self.bucket(key).channel(key).map(|ch| ch.push(frame))
    }

    /// Report room counts and install the cluster-wide totals
    async fn renew_online(&self) -> Result<(), HandlerError> {
        let counts = self.online_counts();
        let all = self.handler.renew_online_count(counts).await?;
        for bucket in &self.buckets {
            bucket.up_rooms_count(&all);
        }
        Ok(())
    }

    fn online_counts(&self) -> HashMap<String, i32> {
        let mut counts = HashMap::new();
        for bucket in &self.buckets {
            for (room, n) in bucket.rooms_count() {
                *counts.entry(room).or_insert(0) += n;
            }
        }
        counts
    }
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    broker: Option<Arc<dyn MessageBroker>>,
    creator: DataCreator,
}

impl ServerBuilder {
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn creator(mut self, creator: DataCreator) -> Self {
        self.creator = creator;
        self
    }

    /// Build the server. Bucket workers and timers start on the current
    /// runtime; nothing listens until [`Server::start`].
    pub fn build(self) -> Server {
        let config = self.config;
        let buckets = (0..config.bucket_size.max(1))
            .map(|_| Bucket::new(&config.bucket))
            .collect();
        let round = Round::new(&config.round);
        let codec = FrameCodec::new(config.read_limit, config.write_limit);
        let permits = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));

        Server {
            shared: Arc::new(Shared {
                config,
                buckets,
                round,
                handler: self.handler,
                broker: self.broker,
                creator: self.creator,
                codec,
                permits,
                accepted: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            local_addrs: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

pub struct Server {
    shared: Arc<Shared>,
    started: AtomicBool,
    local_addrs: parking_lot::Mutex<Vec<SocketAddr>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("server_id", &self.shared.config.server_id)
            .field("buckets", &self.shared.buckets.len())
            .field("local_addrs", &*self.local_addrs.lock())
            .finish()
    }
}

impl Server {
    pub fn builder(config: ServerConfig, handler: Arc<dyn Handler>) -> ServerBuilder {
        ServerBuilder {
            config,
            handler,
            broker: None,
            creator: DataCreator::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Bind every configured address and start accepting. Also starts the
    /// broker inbox loop and the online count refresh. Returns the bound
    /// addresses.
    pub async fn start(&self) -> Result<Vec<SocketAddr>, ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }
        let listeners = match self.bind_all() {
            Ok(listeners) => listeners,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let config = &self.shared.config;
        let mut addrs = Vec::with_capacity(listeners.len());
        for (listener, addr) in listeners {
            tracing::info!(addr = %addr, accept = config.accept, "Listening");
            addrs.push(addr);
            spawn_accept(&self.shared, &listener);
        }

        if let Some(broker) = &self.shared.broker {
            tokio::spawn(broker_loop(Arc::clone(&self.shared), Arc::clone(broker)));
        }
        if !config.renew_online.is_zero() {
            tokio::spawn(renew_online_loop(Arc::clone(&self.shared)));
        }

        self.local_addrs.lock().clone_from(&addrs);
        tracing::info!(
            server_id = %config.server_id,
            buckets = self.shared.buckets.len(),
            "Comet server started"
        );
        Ok(addrs)
    }

    fn bind_all(&self) -> Result<Vec<(Arc<TcpListener>, SocketAddr)>, ServerError> {
        let config = &self.shared.config;
        let mut listeners = Vec::with_capacity(config.bind.len());
        for addr in &config.bind {
            let bind_error = |source| ServerError::Bind {
                addr: addr.clone(),
                source,
            };
            let listener = accept::bind(addr, &config.tcp).map_err(bind_error)?;
            let local = listener.local_addr().map_err(bind_error)?;
            listeners.push((Arc::new(listener), local));
        }
        Ok(listeners)
    }

    /// Start and wait until [`Server::shutdown`] is called
    pub async fn run(&self) -> Result<(), ServerError> {
        self.start().await?;
        self.shared.shutdown.cancelled().await;
        Ok(())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    /// Bucket owning `key`
    pub fn bucket(&self, key: &str) -> &Arc<Bucket> {
        self.shared.bucket(key)
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.shared.buckets
    }

    /// Push a frame to one connection, through the broker when the key is
    /// not connected here
    pub async fn push_key(&self, key: &str, frame: Frame) -> Result<(), ServerError> {
        if let Some(result) = self.shared.push_local(key, frame.clone()) {
            return result.map_err(Into::into);
        }
        match &self.shared.broker {
            Some(broker) => {
                broker.send(InternalMessage::new(0, key, frame)).await?;
                Ok(())
            }
            None => Err(ServerError::NotFound(key.to_string())),
        }
    }

    /// Push to every local connection watching `op`
    pub fn broadcast(&self, frame: &Frame, op: i32) {
        for bucket in &self.shared.buckets {
            bucket.broadcast(frame, op);
        }
    }

    /// Push to every local member of a room
    pub async fn broadcast_room(&self, room_id: &str, frame: Frame) {
        for bucket in &self.shared.buckets {
            bucket
                .broadcast_room(RoomMessage {
                    room_id: room_id.to_string(),
                    frame: frame.clone(),
                })
                .await;
        }
    }

    /// Local member count per room
    pub fn online_counts(&self) -> HashMap<String, i32> {
        self.shared.online_counts()
    }

    /// Run one online count refresh now
    pub async fn renew_online(&self) -> Result<(), ServerError> {
        self.shared.renew_online().await.map_err(Into::into)
    }

    /// Connections currently holding a slot
    pub fn connection_count(&self) -> usize {
        let max = self.shared.config.max_connections.min(Semaphore::MAX_PERMITS);
        max - self.shared.permits.available_permits()
    }

    /// Pooled buffers handed out and not yet returned; negative after a
    /// buffer was returned twice
    pub fn outstanding_buffers(&self) -> isize {
        self.shared.round.outstanding_buffers()
    }

    /// Pooled buffer gets and puts so far
    pub fn buffer_counts(&self) -> (usize, usize) {
        self.shared.round.buffer_counts()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop accepting, close every connection and the broker
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down comet server...");
        self.shared.shutdown.cancel();
        if let Some(broker) = &self.shared.broker {
            if let Err(e) = broker.close().await {
                tracing::warn!(error = %e, "Broker close failed");
            }
        }
        for bucket in &self.shared.buckets {
            bucket.close();
        }
    }
}

fn spawn_accept(shared: &Arc<Shared>, listener: &Arc<TcpListener>) {
    for worker in 0..shared.config.accept.max(1) {
        tokio::spawn(accept::accept_loop(
            Arc::clone(shared),
            Arc::clone(listener),
            worker,
        ));
    }
}

/// Deliver broker messages to local connections
async fn broker_loop(shared: Arc<Shared>, broker: Arc<dyn MessageBroker>) {
    let mut backoff = Backoff::default();
    loop {
        let next = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            next = broker.receive() => next,
        };
        match next {
            Ok(Some(msg)) => {
                backoff.reset();
                match shared.push_local(&msg.receiver, msg.frame) {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        tracing::debug!(key = %msg.receiver, error = %e, "Broker push dropped");
                    }
                    None => tracing::debug!(key = %msg.receiver, "Broker message for unknown key"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "Broker receive failed");
                tokio::select! {
                    () = shared.shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::debug!("Broker loop stopped");
}

async fn renew_online_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.renew_online);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.renew_online().await {
                    tracing::warn!(error = %e, "Online count refresh failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Channel;
    use crate::handlers::IdentifyHandler;
    use crate::protocol::Operation;
    use bytes::Bytes;

    fn server() -> Server {
        let config = ServerConfig {
            bind: vec!["127.0.0.1:0".to_string()],
            bucket_size: 4,
            renew_online: std::time::Duration::ZERO,
            ..ServerConfig::default()
        };
        Server::builder(config, Arc::new(IdentifyHandler::default())).build()
    }

    #[tokio::test]
    async fn test_bucket_choice_is_stable() {
        let server = server();
        assert_eq!(server.buckets().len(), 4);
        assert!(Arc::ptr_eq(server.bucket("user-1"), server.bucket("user-1")));
    }

    #[tokio::test]
    async fn test_push_key_local_and_missing() {
        let server = server();
        let (ch, mut rx) = Channel::new("127.0.0.1", 4, 4);
        ch.authenticated(1, "user-1");
        server.bucket("user-1").put("", &ch);

        let frame = Frame::new(Operation::SendMsgReply, Bytes::from_static(b"hi"));
        server.push_key("user-1", frame.clone()).await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::connection::Signal::Frame(frame.clone())
        );

        let err = server.push_key("user-2", frame).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(key) if key == "user-2"));
    }

    #[tokio::test]
    async fn test_online_counts_merge_buckets() {
        let server = server();
        for key in ["a", "b", "c", "d", "e"] {
            let (ch, _rx) = Channel::new("127.0.0.1", 4, 4);
            ch.authenticated(1, key);
            server.bucket(key).put("room-1", &ch);
        }
        let counts = server.online_counts();
        assert_eq!(counts.get("room-1"), Some(&5));

        server.renew_online().await.unwrap();
        for bucket in server.buckets() {
            if let Some(room) = bucket.room("room-1") {
                assert_eq!(room.online_num(), 5);
            }
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = server();
        let addrs = server.start().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyStarted)
        ));
        server.shutdown().await;
        assert!(server.is_shutdown());
    }

    #[tokio::test]
    async fn test_concurrent_start_binds_once() {
        let server = server();
        let (a, b) = tokio::join!(server.start(), server.start());
        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        assert!(matches!(a.err().or(b.err()), Some(ServerError::AlreadyStarted)));
        assert_eq!(server.local_addrs().len(), 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_error() {
        let config = ServerConfig {
            bind: vec!["not-an-address".to_string()],
            renew_online: std::time::Duration::ZERO,
            ..ServerConfig::default()
        };
        let server = Server::builder(config, Arc::new(IdentifyHandler::default())).build();
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { ref addr, .. } if addr == "not-an-address"));
        // A failed start can be retried
        assert!(matches!(server.start().await, Err(ServerError::Bind { .. })));
        assert!(matches!(AppError::from(err), AppError::Bind { .. }));
    }
}
