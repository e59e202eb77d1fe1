//! Application configuration structs
//!
//! Loads configuration from environment variables or a TOML file.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub server: ServerSettings,
    pub bucket: BucketSettings,
    pub round: RoundSettings,
    pub channel: ChannelSettings,
    pub protocol: ProtocolSettings,
    /// Cross-node broker; single-node mode when absent
    pub redis: Option<RedisConfig>,
}

/// General application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub env: Environment,
    /// Node identity used for cross-node routing; generated when empty
    pub server_id: String,
    /// Verbose per-frame logging
    pub debug: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            env: Environment::default(),
            server_id: String::new(),
            debug: false,
        }
    }
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "production" => Some(Self::Production),
            "staging" => Some(Self::Staging),
            "development" => Some(Self::Development),
            _ => None,
        }
    }
}

/// Listener and per-connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Addresses to bind, e.g. `0.0.0.0:3101`
    pub bind: Vec<String>,
    /// Accept tasks per bound address
    pub accept: usize,
    pub max_connections: usize,
    /// Largest body accepted from a client
    pub read_limit: usize,
    /// Largest body written to a client
    pub write_limit: usize,
    pub keepalive: bool,
    pub sndbuf: usize,
    pub rcvbuf: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: vec!["0.0.0.0:3101".to_string()],
            accept: 1,
            max_connections: 65536,
            read_limit: 1 << 12,
            write_limit: 1 << 22,
            keepalive: false,
            sndbuf: 4096,
            rcvbuf: 4096,
        }
    }
}

/// Connection shard settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BucketSettings {
    /// Number of buckets
    pub size: usize,
    /// Initial connection map capacity per bucket
    pub channel: usize,
    /// Initial room map capacity per bucket
    pub room: usize,
    /// Room broadcast workers per bucket
    pub routine_amount: usize,
    /// Queue depth of each room broadcast worker
    pub routine_size: usize,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            size: 32,
            channel: 1024,
            room: 1024,
            routine_amount: 32,
            routine_size: 1024,
        }
    }
}

/// Timer shards and buffer pools handed out round-robin
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoundSettings {
    pub timer: usize,
    pub timer_size: usize,
    pub reader: usize,
    pub read_buf: usize,
    pub read_buf_size: usize,
    pub writer: usize,
    pub write_buf: usize,
    pub write_buf_size: usize,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            timer: 32,
            timer_size: 2048,
            reader: 32,
            read_buf: 1024,
            read_buf_size: 8192,
            writer: 32,
            write_buf: 1024,
            write_buf_size: 8192,
        }
    }
}

/// Per-connection queue sizes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Outbound signal queue depth
    pub svr_proto: usize,
    /// Inbound ring size (rounded up to a power of two)
    pub cli_proto: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            svr_proto: 10,
            cli_proto: 5,
        }
    }
}

/// Handshake and heartbeat bounds, all in milliseconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub handshake_timeout_ms: u64,
    pub min_heartbeat_ms: u64,
    pub max_heartbeat_ms: u64,
    /// Interval of the online-count refresh; 0 disables it
    pub renew_online_ms: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 8_000,
            min_heartbeat_ms: 60_000,
            max_heartbeat_ms: 600_000,
            renew_online_ms: 10_000,
        }
    }
}

impl ProtocolSettings {
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn min_heartbeat(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_ms)
    }

    #[must_use]
    pub fn max_heartbeat(&self) -> Duration {
        Duration::from_millis(self.max_heartbeat_ms)
    }
}

/// Redis configuration for the cross-node broker
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_app_name() -> String {
    "comet".to_string()
}

fn default_redis_max_connections() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

/// Parse an optional variable, falling back to `default` when unset
fn var_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, raw)),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// Every variable is optional; malformed values are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let d = Self::default();

        let app = AppSettings {
            name: env::var("COMET_APP_NAME").unwrap_or(d.app.name),
            env: env::var("COMET_ENV")
                .ok()
                .and_then(|s| Environment::parse(&s))
                .unwrap_or_default(),
            server_id: env::var("COMET_SERVER_ID").unwrap_or_default(),
            debug: var_or("COMET_DEBUG", d.app.debug)?,
        };

        let server = ServerSettings {
            bind: env::var("COMET_BIND")
                .ok()
                .map(|s| s.split(',').map(str::trim).map(String::from).collect())
                .unwrap_or(d.server.bind),
            accept: var_or("COMET_ACCEPT", d.server.accept)?,
            max_connections: var_or("COMET_MAX_CONNECTIONS", d.server.max_connections)?,
            read_limit: var_or("COMET_READ_LIMIT", d.server.read_limit)?,
            write_limit: var_or("COMET_WRITE_LIMIT", d.server.write_limit)?,
            keepalive: var_or("COMET_TCP_KEEPALIVE", d.server.keepalive)?,
            sndbuf: var_or("COMET_TCP_SNDBUF", d.server.sndbuf)?,
            rcvbuf: var_or("COMET_TCP_RCVBUF", d.server.rcvbuf)?,
        };

        let bucket = BucketSettings {
            size: var_or("COMET_BUCKET_SIZE", d.bucket.size)?,
            channel: var_or("COMET_BUCKET_CHANNEL", d.bucket.channel)?,
            room: var_or("COMET_BUCKET_ROOM", d.bucket.room)?,
            routine_amount: var_or("COMET_BUCKET_ROUTINE_AMOUNT", d.bucket.routine_amount)?,
            routine_size: var_or("COMET_BUCKET_ROUTINE_SIZE", d.bucket.routine_size)?,
        };

        let round = RoundSettings {
            timer: var_or("COMET_ROUND_TIMER", d.round.timer)?,
            timer_size: var_or("COMET_ROUND_TIMER_SIZE", d.round.timer_size)?,
            reader: var_or("COMET_ROUND_READER", d.round.reader)?,
            read_buf: var_or("COMET_ROUND_READ_BUF", d.round.read_buf)?,
            read_buf_size: var_or("COMET_ROUND_READ_BUF_SIZE", d.round.read_buf_size)?,
            writer: var_or("COMET_ROUND_WRITER", d.round.writer)?,
            write_buf: var_or("COMET_ROUND_WRITE_BUF", d.round.write_buf)?,
            write_buf_size: var_or("COMET_ROUND_WRITE_BUF_SIZE", d.round.write_buf_size)?,
        };

        let channel = ChannelSettings {
            svr_proto: var_or("COMET_CHANNEL_SVR_PROTO", d.channel.svr_proto)?,
            cli_proto: var_or("COMET_CHANNEL_CLI_PROTO", d.channel.cli_proto)?,
        };

        let protocol = ProtocolSettings {
            handshake_timeout_ms: var_or(
                "COMET_HANDSHAKE_TIMEOUT_MS",
                d.protocol.handshake_timeout_ms,
            )?,
            min_heartbeat_ms: var_or("COMET_MIN_HEARTBEAT_MS", d.protocol.min_heartbeat_ms)?,
            max_heartbeat_ms: var_or("COMET_MAX_HEARTBEAT_MS", d.protocol.max_heartbeat_ms)?,
            renew_online_ms: var_or("COMET_RENEW_ONLINE_MS", d.protocol.renew_online_ms)?,
        };

        let redis = match env::var("REDIS_URL") {
            Ok(url) => Some(RedisConfig {
                url,
                max_connections: var_or(
                    "REDIS_MAX_CONNECTIONS",
                    default_redis_max_connections(),
                )?,
                reconnect_delay_ms: var_or(
                    "REDIS_RECONNECT_DELAY_MS",
                    default_reconnect_delay_ms(),
                )?,
            }),
            Err(_) => None,
        };

        let config = Self {
            app,
            server,
            bucket,
            round,
            channel,
            protocol,
            redis,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, overridden by `COMET__SECTION__KEY`
    /// environment variables
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config: Self = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("COMET").separator("__"))
            .build()
            .and_then(::config::Config::try_deserialize)
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, usize); 8] = [
            ("bucket.size", self.bucket.size),
            ("bucket.routine_amount", self.bucket.routine_amount),
            ("bucket.routine_size", self.bucket.routine_size),
            ("round.timer", self.round.timer),
            ("round.reader", self.round.reader),
            ("round.writer", self.round.writer),
            ("channel.svr_proto", self.channel.svr_proto),
            ("channel.cli_proto", self.channel.cli_proto),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(name, value.to_string()));
            }
        }
        if self.server.bind.is_empty() {
            return Err(ConfigError::MissingVar("server.bind"));
        }
        if self.protocol.min_heartbeat_ms > self.protocol.max_heartbeat_ms {
            return Err(ConfigError::InvalidValue(
                "protocol.min_heartbeat_ms",
                self.protocol.min_heartbeat_ms.to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}
