//! Comet gateway entry point
//!
//! Run with:
//! ```bash
//! cargo run -p comet-gateway
//! ```
//!
//! Configuration is loaded from environment variables. When `REDIS_URL` is
//! set, connection routes are shared through Redis.

use comet_common::{try_init_tracing_with_config, AppConfig, AppError, AppResult, TracingConfig};
use comet_gateway::{IdentifyHandler, MessageBroker, RedisBroker, Server, ServerConfig};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, code = e.error_code(), "Gateway failed");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let config = AppConfig::from_env()?;

    if let Err(e) = try_init_tracing_with_config(TracingConfig::for_environment(config.app.env)) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    info!(
        env = ?config.app.env,
        bind = ?config.server.bind,
        "Starting Comet Gateway..."
    );

    let server_config = ServerConfig::from(&config);
    let handler = Arc::new(IdentifyHandler::new(server_config.max_heartbeat));
    let mut builder = Server::builder(server_config.clone(), handler);

    if let Some(redis) = &config.redis {
        let broker = RedisBroker::connect(redis, server_config.server_id.clone())
            .await
            .map_err(AppError::broker)?
            .with_route_ttl(server_config.max_heartbeat * 3);
        builder = builder.broker(Arc::new(broker) as Arc<dyn MessageBroker>);
    }

    let server = builder.build();
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    server.shutdown().await;
    Ok(())
}
