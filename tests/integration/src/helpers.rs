//! Test helpers for integration tests
//!
//! Provides a gateway bound to an ephemeral port and a framed client that
//! speaks the wire protocol.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use comet_gateway::handlers::IdentifyRequest;
use comet_gateway::{
    Frame, FrameCodec, Handler, IdentifyHandler, MessageBroker, Operation, Server, ServerConfig,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// How long a client waits for a frame before failing the test
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Config for a test server on 127.0.0.1 with an ephemeral port
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig {
        bind: vec!["127.0.0.1:0".to_string()],
        bucket_size: 4,
        max_connections: 128,
        handshake_timeout: Duration::from_secs(2),
        min_heartbeat: Duration::from_millis(500),
        max_heartbeat: Duration::from_secs(30),
        renew_online: Duration::ZERO,
        ..ServerConfig::default()
    };
    config.round.timer = 2;
    config.round.reader = 2;
    config.round.writer = 2;
    config.round.read_buf = 4;
    config.round.write_buf = 4;
    config.bucket.routine_amount = 2;
    config
}

/// Test server instance that shuts down on drop
pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
}

impl TestServer {
    /// Start a server with the identify handler and default test config
    pub async fn start() -> Result<Self> {
        Self::start_with(test_config(), Arc::new(IdentifyHandler::default()), None).await
    }

    /// Start a test server with custom config
    pub async fn start_with_config(config: ServerConfig) -> Result<Self> {
        Self::start_with(config, Arc::new(IdentifyHandler::default()), None).await
    }

    pub async fn start_with(
        config: ServerConfig,
        handler: Arc<dyn Handler>,
        broker: Option<Arc<dyn MessageBroker>>,
    ) -> Result<Self> {
        let mut builder = Server::builder(config, handler);
        if let Some(broker) = broker {
            builder = builder.broker(broker);
        }
        let server = Arc::new(builder.build());
        let addrs = server.start().await?;
        let addr = *addrs.first().context("server bound no address")?;
        Ok(Self { server, addr })
    }

    /// Open a raw framed connection
    pub async fn connect(&self) -> Result<TestClient> {
        TestClient::connect(self.addr).await
    }

    /// Connect and authenticate, returning the client and the auth reply
    pub async fn login(&self, request: &IdentifyRequest) -> Result<(TestClient, Frame)> {
        let mut client = self.connect().await?;
        let reply = client.auth(request).await?;
        Ok((client, reply))
    }

    /// Wait until `cond` holds, polling every 10ms
    pub async fn wait_for(&self, what: &str, cond: impl Fn(&Server) -> bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while !cond(&self.server) {
            if tokio::time::Instant::now() > deadline {
                bail!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

/// Every pooled buffer taken has been given back exactly once
pub fn buffers_returned(server: &Server) -> bool {
    let (gets, puts) = server.buffer_counts();
    gets == puts && server.outstanding_buffers() == 0
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let server = Arc::clone(&self.server);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { server.shutdown().await });
        }
    }
}

/// Framed client connection
pub struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
    sequence: i32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::default()),
            sequence: 0,
        })
    }

    /// Send a frame with the next sequence number, returning the number
    pub async fn send(&mut self, op: impl Into<i32>, body: impl Into<Bytes>) -> Result<i32> {
        self.sequence += 1;
        let frame = Frame::new(op, body).with_sequence(self.sequence);
        self.framed.send(frame).await?;
        Ok(self.sequence)
    }

    /// Next frame from the server
    pub async fn recv(&mut self) -> Result<Frame> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(frame)) => Ok(frame?),
            Ok(None) => Err(anyhow!("connection closed")),
            Err(_) => Err(anyhow!("timed out waiting for a frame")),
        }
    }

    /// Next frame, skipping pushes until one with `op` arrives
    pub async fn recv_op(&mut self, op: impl Into<i32>) -> Result<Frame> {
        let op = op.into();
        loop {
            let frame = self.recv().await?;
            if frame.operation == op {
                return Ok(frame);
            }
        }
    }

    /// Whether the server closed the connection within `within`
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        matches!(
            tokio::time::timeout(within, self.framed.next()).await,
            Ok(None | Some(Err(_)))
        )
    }

    /// Nothing arrives within `within`
    pub async fn silent_for(&mut self, within: Duration) -> bool {
        tokio::time::timeout(within, self.framed.next()).await.is_err()
    }

    pub async fn auth(&mut self, request: &IdentifyRequest) -> Result<Frame> {
        let body = serde_json::to_vec(request)?;
        self.send(Operation::Auth, body).await?;
        let reply = self.recv().await?;
        if !reply.is(Operation::AuthReply) {
            bail!("expected auth reply, got op {}", reply.operation);
        }
        Ok(reply)
    }

    pub async fn heartbeat(&mut self) -> Result<Frame> {
        self.send(Operation::Heartbeat, Bytes::new()).await?;
        self.recv_op(Operation::HeartbeatReply).await
    }
}
