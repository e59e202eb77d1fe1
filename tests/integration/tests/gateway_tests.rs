//! Gateway integration tests
//!
//! Every test runs its own server on an ephemeral port; no external
//! services are needed.
//!
//! Run with: cargo test -p integration-tests --test gateway_tests

use async_trait::async_trait;
use bytes::Bytes;
use comet_gateway::handlers::IdentifyRequest;
use comet_gateway::{
    AuthReply, Channel, Frame, Handler, HandlerResult, IdentifyHandler, LocalBroker, LocalHub,
    MessageBroker, Operation,
};
use integration_tests::{buffers_returned, identify, test_config, unique_room, TestServer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(200);

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_auth_reply() {
    let server = TestServer::start().await.unwrap();
    let request = identify("", &[]);

    let mut client = server.connect().await.unwrap();
    let seq = client
        .send(Operation::Auth, serde_json::to_vec(&request).unwrap())
        .await
        .unwrap();
    let reply = client.recv().await.unwrap();

    assert!(reply.is(Operation::AuthReply));
    assert_eq!(reply.sequence, seq);
    let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body["key"], request.key.as_str());

    let bucket = server.server.bucket(&request.key);
    let ch = bucket.channel(&request.key).unwrap();
    assert_eq!(ch.mid(), request.mid);
    assert_eq!(bucket.ip_connections("127.0.0.1"), 1);
}

/// Identify handler with a fixed heartbeat that counts handled frames
struct FixedHeartbeatHandler {
    inner: IdentifyHandler,
    heartbeat: Duration,
    frames: AtomicUsize,
}

impl FixedHeartbeatHandler {
    fn new(heartbeat: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: IdentifyHandler::default(),
            heartbeat,
            frames: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Handler for FixedHeartbeatHandler {
    async fn authenticate(&self, channel: &Channel, frame: &Frame) -> HandlerResult<AuthReply> {
        let mut reply = self.inner.authenticate(channel, frame).await?;
        reply.heartbeat = self.heartbeat;
        Ok(reply)
    }

    async fn handle_frame(&self, channel: &Channel, frame: &mut Frame) -> HandlerResult<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        self.inner.handle_frame(channel, frame).await
    }

    async fn handle_closed(&self, _channel: &Channel) {}

    async fn renew_online_count(
        &self,
        counts: HashMap<String, i32>,
    ) -> HandlerResult<HashMap<String, i32>> {
        Ok(counts)
    }
}

#[tokio::test]
async fn test_frames_before_auth_are_discarded() {
    let handler = FixedHeartbeatHandler::new(Duration::from_secs(10));
    let server = TestServer::start_with(test_config(), Arc::clone(&handler) as Arc<dyn Handler>, None)
        .await
        .unwrap();
    let mut client = server.connect().await.unwrap();

    client.send(Operation::Heartbeat, Bytes::new()).await.unwrap();
    client.send(1000, Bytes::from_static(b"early")).await.unwrap();
    let reply = client.auth(&identify("", &[])).await.unwrap();
    assert!(reply.is(Operation::AuthReply));
    assert_eq!(handler.frames.load(Ordering::SeqCst), 0);

    // Only frames after auth reach the handler
    client.send(1000, Bytes::from_static(b"late")).await.unwrap();
    let echoed = client.recv_op(1000).await.unwrap();
    assert_eq!(echoed.body, Bytes::from_static(b"late"));
    assert_eq!(handler.frames.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handshake_timeout_returns_buffers() {
    let mut config = test_config();
    config.handshake_timeout = Duration::from_millis(200);
    let server = TestServer::start_with_config(config).await.unwrap();
    let mut client = server.connect().await.unwrap();

    assert!(client.closed_within(Duration::from_secs(3)).await);
    server
        .wait_for("connection release", |s| {
            s.connection_count() == 0 && buffers_returned(s)
        })
        .await
        .unwrap();
    assert_eq!(server.server.buffer_counts(), (2, 2));
}

#[tokio::test]
async fn test_rejected_auth_closes_connection() {
    let server = TestServer::start().await.unwrap();
    let mut client = server.connect().await.unwrap();
    let request = IdentifyRequest {
        mid: 0,
        ..identify("", &[])
    };

    client
        .send(Operation::Auth, serde_json::to_vec(&request).unwrap())
        .await
        .unwrap();
    assert!(client.closed_within(Duration::from_secs(3)).await);
    assert!(server.server.bucket(&request.key).channel(&request.key).is_none());
    server
        .wait_for("buffers returned", buffers_returned)
        .await
        .unwrap();
    assert_eq!(server.server.buffer_counts(), (2, 2));
}

// ============================================================================
// Heartbeat and replies
// ============================================================================

#[tokio::test]
async fn test_oversized_heartbeat_is_capped() {
    let mut config = test_config();
    config.max_heartbeat = Duration::from_secs(1);
    let server = TestServer::start_with_config(config).await.unwrap();
    let request = IdentifyRequest {
        heartbeat: u64::MAX,
        ..identify("", &[])
    };

    let (mut client, _) = server.login(&request).await.unwrap();
    client.heartbeat().await.unwrap();

    // Expires at the one second maximum once heartbeats stop
    assert!(client.closed_within(Duration::from_secs(3)).await);
    server
        .wait_for("teardown", |s| s.connection_count() == 0 && buffers_returned(s))
        .await
        .unwrap();
    assert_eq!(server.server.buffer_counts(), (2, 2));

    // The shared timer still serves new connections
    let (mut next, _) = server.login(&identify("", &[])).await.unwrap();
    next.heartbeat().await.unwrap();
}

#[tokio::test]
async fn test_zero_heartbeat_uses_maximum() {
    let mut config = test_config();
    config.max_heartbeat = Duration::from_secs(1);
    let handler = FixedHeartbeatHandler::new(Duration::ZERO);
    let server = TestServer::start_with(config, handler, None).await.unwrap();

    let (mut client, _) = server.login(&identify("", &[])).await.unwrap();
    assert!(client.silent_for(Duration::from_millis(300)).await);
    assert!(client.closed_within(Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_short_heartbeat_raised_to_minimum() {
    let mut config = test_config();
    config.min_heartbeat = Duration::from_millis(800);
    config.max_heartbeat = Duration::from_secs(2);
    let handler = FixedHeartbeatHandler::new(Duration::from_millis(10));
    let server = TestServer::start_with(config, handler, None).await.unwrap();

    let (mut client, _) = server.login(&identify("", &[])).await.unwrap();
    assert!(client.silent_for(Duration::from_millis(400)).await);
    assert!(client.closed_within(Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_heartbeat_reply() {
    let server = TestServer::start().await.unwrap();
    let (mut client, _) = server.login(&identify("", &[])).await.unwrap();

    let seq = client.send(Operation::Heartbeat, Bytes::from_static(b"ping")).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert!(reply.is(Operation::HeartbeatReply));
    assert_eq!(reply.sequence, seq);
    assert!(reply.body.is_empty());
}

#[tokio::test]
async fn test_missed_heartbeat_closes_connection() {
    let server = TestServer::start().await.unwrap();
    let request = IdentifyRequest {
        heartbeat: 1,
        ..identify("", &[])
    };
    let (mut client, _) = server.login(&request).await.unwrap();

    // Heartbeats keep it open past the first deadline
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        client.heartbeat().await.unwrap();
    }

    assert!(client.closed_within(Duration::from_secs(3)).await);
    server
        .wait_for("channel removal", |s| s.bucket(&request.key).channel(&request.key).is_none())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_send_msg_echo() {
    let server = TestServer::start().await.unwrap();
    let (mut client, _) = server.login(&identify("", &[])).await.unwrap();

    let seq = client.send(Operation::SendMsg, Bytes::from_static(b"hello")).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert!(reply.is(Operation::SendMsgReply));
    assert_eq!(reply.sequence, seq);
    assert_eq!(reply.body, Bytes::from_static(b"hello"));
}

#[tokio::test]
async fn test_replies_keep_request_order() {
    let server = TestServer::start().await.unwrap();
    let (mut client, _) = server.login(&identify("", &[])).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..50 {
        let body = Bytes::from(format!("msg-{i}"));
        sent.push(client.send(Operation::SendMsg, body).await.unwrap());
    }
    for seq in sent {
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.sequence, seq);
    }
}

// ============================================================================
// Push and broadcast
// ============================================================================

#[tokio::test]
async fn test_broadcast_respects_watched_ops() {
    let server = TestServer::start().await.unwrap();
    let (mut watcher, _) = server.login(&identify("", &[1000])).await.unwrap();
    let (mut other, _) = server.login(&identify("", &[])).await.unwrap();

    server
        .server
        .broadcast(&Frame::new(1000, Bytes::from_static(b"news")), 1000);

    let pushed = watcher.recv().await.unwrap();
    assert_eq!(pushed.operation, 1000);
    assert_eq!(pushed.body, Bytes::from_static(b"news"));
    assert!(other.silent_for(QUIET).await);
}

#[tokio::test]
async fn test_sub_and_unsub() {
    let server = TestServer::start().await.unwrap();
    let (mut client, _) = server.login(&identify("", &[])).await.unwrap();

    client.send(Operation::Sub, Bytes::from_static(b"1000,1001")).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert!(reply.is(Operation::SubReply));
    assert_eq!(reply.body, Bytes::from_static(b"1000,1001"));

    server.server.broadcast(&Frame::new(1001, Bytes::new()), 1001);
    assert_eq!(client.recv().await.unwrap().operation, 1001);

    client.send(Operation::Unsub, Bytes::from_static(b"1001")).await.unwrap();
    assert!(client.recv().await.unwrap().is(Operation::UnsubReply));

    server.server.broadcast(&Frame::new(1001, Bytes::new()), 1001);
    assert!(client.silent_for(QUIET).await);
}

#[tokio::test]
async fn test_room_broadcast() {
    let server = TestServer::start().await.unwrap();
    let room = unique_room();
    let (mut a, _) = server.login(&identify(&room, &[])).await.unwrap();
    let (mut b, _) = server.login(&identify(&room, &[])).await.unwrap();
    let (mut outsider, _) = server.login(&identify(&unique_room(), &[])).await.unwrap();

    assert_eq!(server.server.online_counts().get(&room), Some(&2));

    server
        .server
        .broadcast_room(&room, Frame::new(2000, Bytes::from_static(b"room")))
        .await;

    assert_eq!(a.recv().await.unwrap().operation, 2000);
    assert_eq!(b.recv().await.unwrap().operation, 2000);
    assert!(outsider.silent_for(QUIET).await);
}

#[tokio::test]
async fn test_change_room() {
    let server = TestServer::start().await.unwrap();
    let (first, second) = (unique_room(), unique_room());
    let request = identify(&first, &[]);
    let (mut client, _) = server.login(&request).await.unwrap();

    client
        .send(Operation::ChangeRoom, Bytes::from(second.clone()))
        .await
        .unwrap();
    let reply = client.recv().await.unwrap();
    assert!(reply.is(Operation::ChangeRoomReply));

    let counts = server.server.online_counts();
    assert_eq!(counts.get(&second), Some(&1));
    assert!(!counts.contains_key(&first));

    server
        .server
        .broadcast_room(&second, Frame::new(2001, Bytes::new()))
        .await;
    assert_eq!(client.recv().await.unwrap().operation, 2001);
}

#[tokio::test]
async fn test_push_key() {
    let server = TestServer::start().await.unwrap();
    let request = identify("", &[]);
    let (mut client, _) = server.login(&request).await.unwrap();

    server
        .server
        .push_key(&request.key, Frame::new(3000, Bytes::from_static(b"direct")))
        .await
        .unwrap();
    let pushed = client.recv().await.unwrap();
    assert_eq!(pushed.operation, 3000);
    assert_eq!(pushed.body, Bytes::from_static(b"direct"));

    assert!(server
        .server
        .push_key("nobody", Frame::new(3000, Bytes::new()))
        .await
        .is_err());
}

#[tokio::test]
async fn test_push_key_across_nodes() {
    let hub = LocalHub::new();
    let broker_a: Arc<dyn MessageBroker> = Arc::new(LocalBroker::with_hub(Arc::clone(&hub), "node-a"));
    let broker_b: Arc<dyn MessageBroker> = Arc::new(LocalBroker::with_hub(Arc::clone(&hub), "node-b"));

    let node_a = TestServer::start_with(
        test_config(),
        Arc::new(IdentifyHandler::default()),
        Some(broker_a),
    )
    .await
    .unwrap();
    let node_b = TestServer::start_with(
        test_config(),
        Arc::new(IdentifyHandler::default()),
        Some(broker_b),
    )
    .await
    .unwrap();

    let request = identify("", &[]);
    let (mut client, _) = node_b.login(&request).await.unwrap();
    assert_eq!(hub.route(&request.key).as_deref(), Some("node-b"));

    node_a
        .server
        .push_key(&request.key, Frame::new(3001, Bytes::from_static(b"relayed")))
        .await
        .unwrap();
    let pushed = client.recv().await.unwrap();
    assert_eq!(pushed.operation, 3001);
    assert_eq!(pushed.body, Bytes::from_static(b"relayed"));

    drop(client);
    node_b
        .wait_for("route release", |_| hub.route(&request.key).is_none())
        .await
        .unwrap();
}

// ============================================================================
// Teardown
// ============================================================================

/// Identify handler that counts closed connections
#[derive(Default)]
struct CountingHandler {
    inner: IdentifyHandler,
    closed: AtomicUsize,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn authenticate(&self, channel: &Channel, frame: &Frame) -> HandlerResult<AuthReply> {
        self.inner.authenticate(channel, frame).await
    }

    async fn handle_frame(&self, channel: &Channel, frame: &mut Frame) -> HandlerResult<()> {
        self.inner.handle_frame(channel, frame).await
    }

    async fn handle_closed(&self, _channel: &Channel) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn renew_online_count(
        &self,
        counts: HashMap<String, i32>,
    ) -> HandlerResult<HashMap<String, i32>> {
        Ok(counts.into_iter().map(|(room, n)| (room, n * 10)).collect())
    }
}

#[tokio::test]
async fn test_disconnect_cleans_up_once() {
    let handler = Arc::new(CountingHandler::default());
    let server = TestServer::start_with(test_config(), Arc::clone(&handler) as Arc<dyn Handler>, None)
        .await
        .unwrap();
    let room = unique_room();
    let request = identify(&room, &[]);
    let (client, _) = server.login(&request).await.unwrap();
    assert_eq!(server.server.connection_count(), 1);

    drop(client);
    server
        .wait_for("teardown", |s| {
            s.connection_count() == 0 && buffers_returned(s)
        })
        .await
        .unwrap();
    assert_eq!(server.server.buffer_counts(), (2, 2));

    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    let bucket = server.server.bucket(&request.key);
    assert!(bucket.channel(&request.key).is_none());
    assert!(bucket.room(&room).is_none());
    assert_eq!(bucket.ip_connections("127.0.0.1"), 0);
}

#[tokio::test]
async fn test_same_key_replaces_connection() {
    let server = TestServer::start().await.unwrap();
    let request = identify("", &[]);
    let (mut old, _) = server.login(&request).await.unwrap();
    let (mut new, _) = server.login(&request).await.unwrap();

    assert!(old.closed_within(Duration::from_secs(3)).await);
    new.heartbeat().await.unwrap();

    let bucket = server.server.bucket(&request.key);
    server
        .wait_for("old connection teardown", |s| s.connection_count() == 1)
        .await
        .unwrap();
    assert!(bucket.channel(&request.key).is_some());
    assert_eq!(bucket.ip_connections("127.0.0.1"), 1);
}

#[tokio::test]
async fn test_renew_online_counts() {
    let handler = Arc::new(CountingHandler::default());
    let server = TestServer::start_with(test_config(), handler, None).await.unwrap();
    let room = unique_room();
    let request = identify(&room, &[]);
    let (_client, _) = server.login(&request).await.unwrap();

    server.server.renew_online().await.unwrap();
    let online = server
        .server
        .bucket(&request.key)
        .room(&room)
        .unwrap()
        .online_num();
    assert_eq!(online, 10);
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = test_config();
    config.max_connections = 1;
    let server = TestServer::start_with_config(config).await.unwrap();

    let (mut first, _) = server.login(&identify("", &[])).await.unwrap();
    let mut second = server.connect().await.unwrap();
    assert!(second.closed_within(Duration::from_secs(3)).await);

    first.heartbeat().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::start().await.unwrap();
    let (mut client, _) = server.login(&identify("", &[])).await.unwrap();

    server.server.shutdown().await;
    assert!(client.closed_within(Duration::from_secs(3)).await);
    server
        .wait_for("teardown", buffers_returned)
        .await
        .unwrap();
    assert_eq!(server.server.buffer_counts(), (2, 2));
}
