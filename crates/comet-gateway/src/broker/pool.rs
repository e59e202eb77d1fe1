//! Redis connection pool using deadpool-redis

use super::BrokerError;
use deadpool_redis::{Config, Pool, Runtime};

/// Managed Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("status", &self.pool.status())
            .finish()
    }
}

impl RedisPool {
    pub fn new(url: &str, max_connections: usize) -> Result<Self, BrokerError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| BrokerError::Pool(e.to_string()))?
            .max_size(max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BrokerError::Pool(e.to_string()))?;

        tracing::info!(
            url = %redact(url),
            max_connections,
            "Redis pool created"
        );
        Ok(Self { pool })
    }

    pub fn from_config(config: &comet_common::RedisConfig) -> Result<Self, BrokerError> {
        Self::new(&config.url, config.max_connections as usize)
    }

    pub async fn get(&self) -> Result<deadpool_redis::Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Pool(e.to_string()))
    }

    #[must_use]
    pub fn status(&self) -> deadpool_redis::Status {
        self.pool.status()
    }

    /// Ping Redis through a pooled connection
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.get().await?;
        ::redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Strip credentials from a Redis URL for logging
pub(crate) fn redact(url: &str) -> &str {
    url.split('@').next_back().unwrap_or(url)
}
