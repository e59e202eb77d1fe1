//! Server knobs

use crate::broadcast::BucketOptions;
use crate::protocol::{DEFAULT_READ_LIMIT, DEFAULT_WRITE_LIMIT};
use crate::round::RoundOptions;
use comet_common::AppConfig;
use rand::Rng;
use std::time::Duration;

/// Socket options applied to every listener
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub keepalive: bool,
    pub sndbuf: usize,
    pub rcvbuf: usize,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            keepalive: false,
            sndbuf: 4096,
            rcvbuf: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Node identity used for broker routes
    pub server_id: String,
    pub bind: Vec<String>,
    /// Accept tasks per listener
    pub accept: usize,
    pub max_connections: usize,
    pub read_limit: usize,
    pub write_limit: usize,
    pub tcp: TcpOptions,
    /// Number of buckets
    pub bucket_size: usize,
    pub bucket: BucketOptions,
    pub round: RoundOptions,
    /// Outbound signal queue depth per connection
    pub svr_proto: usize,
    /// Inbound ring size per connection
    pub cli_proto: usize,
    pub handshake_timeout: Duration,
    /// Bounds of the randomized interval at which a heartbeating client's
    /// broker route is renewed
    pub min_heartbeat: Duration,
    pub max_heartbeat: Duration,
    /// Online count refresh interval; zero disables the task
    pub renew_online: Duration,
    /// Per-frame debug logging
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            bind: vec!["0.0.0.0:3101".to_string()],
            accept: 1,
            max_connections: 65536,
            read_limit: DEFAULT_READ_LIMIT,
            write_limit: DEFAULT_WRITE_LIMIT,
            tcp: TcpOptions::default(),
            bucket_size: 32,
            bucket: BucketOptions::default(),
            round: RoundOptions::default(),
            svr_proto: 10,
            cli_proto: 5,
            handshake_timeout: Duration::from_secs(8),
            min_heartbeat: Duration::from_secs(60),
            max_heartbeat: Duration::from_secs(600),
            renew_online: Duration::from_secs(10),
            debug: false,
        }
    }
}

impl ServerConfig {
    /// A random interval between the heartbeat bounds, so renewals from
    /// many connections spread out
    pub fn random_server_heartbeat(&self) -> Duration {
        let min = self.min_heartbeat.as_millis() as u64;
        let max = self.max_heartbeat.as_millis() as u64;
        if max <= min {
            return self.min_heartbeat;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Heartbeat deadline for a connection whose handler asked for
    /// `requested`. Zero means the maximum; anything else is kept within the
    /// heartbeat bounds.
    pub fn client_heartbeat(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            return self.max_heartbeat;
        }
        requested.max(self.min_heartbeat).min(self.max_heartbeat)
    }
}

impl From<&AppConfig> for ServerConfig {
    fn from(config: &AppConfig) -> Self {
        let server_id = if config.app.server_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.app.server_id.clone()
        };

        Self {
            server_id,
            bind: config.server.bind.clone(),
            accept: config.server.accept,
            max_connections: config.server.max_connections,
            read_limit: config.server.read_limit,
            write_limit: config.server.write_limit,
            tcp: TcpOptions {
                keepalive: config.server.keepalive,
                sndbuf: config.server.sndbuf,
                rcvbuf: config.server.rcvbuf,
            },
            bucket_size: config.bucket.size,
            bucket: BucketOptions {
                channel: config.bucket.channel,
                room: config.bucket.room,
                routine_amount: config.bucket.routine_amount,
                routine_size: config.bucket.routine_size,
            },
            round: RoundOptions {
                timer: config.round.timer,
                timer_size: config.round.timer_size,
                reader: config.round.reader,
                read_buf: config.round.read_buf,
                read_buf_size: config.round.read_buf_size,
                writer: config.round.writer,
                write_buf: config.round.write_buf,
                write_buf_size: config.round.write_buf_size,
            },
            svr_proto: config.channel.svr_proto,
            cli_proto: config.channel.cli_proto,
            handshake_timeout: config.protocol.handshake_timeout(),
            min_heartbeat: config.protocol.min_heartbeat(),
            max_heartbeat: config.protocol.max_heartbeat(),
            renew_online: Duration::from_millis(config.protocol.renew_online_ms),
            debug: config.app.debug,
        }
    }
}
