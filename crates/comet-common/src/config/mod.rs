//! Configuration structs

mod app_config;

pub use app_config::{
    AppConfig, AppSettings, BucketSettings, ChannelSettings, ConfigError, Environment,
    ProtocolSettings, RedisConfig, RoundSettings, ServerSettings,
};
