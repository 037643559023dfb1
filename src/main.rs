//! Retrying reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request       ┌──────────────────────────────────────────────────┐
//!     ─────────────────────┼─▶ trace → request-id → timeout → retry ──┐       │
//!                          │                                          ▼       │
//!                          │                   ┌──────────────────────────┐   │
//!                          │   attempt 1..N    │ forward handler          │───┼──▶ Upstream
//!                          │  ◀────────────────│ (hyper-util client)      │◀──┼───
//!                          │                   └──────────────────────────┘   │
//!     Client Response      │  retry: retryable status on attempt < N          │
//!     ◀────────────────────┼─ settle: first non-retryable or last attempt     │
//!                          └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use retry_proxy::config::{load_config, validate_config, ConfigError, ProxyConfig};
use retry_proxy::lifecycle::{wait_for_signal, Shutdown};
use retry_proxy::observability::{logging, metrics};
use retry_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "retry-proxy")]
#[command(about = "Reverse proxy that retries upstream responses with retryable status codes", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the upstream address.
    #[arg(long)]
    upstream: Option<String>,

    /// Override the log level.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(upstream) = &self.upstream {
            config.upstream.address = upstream.clone();
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load()?;

    logging::init(&config.observability);
    tracing::info!("retry-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        attempts = config.retry.attempts,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(config)?;
    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger();
    });

    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
