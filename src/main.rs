//! Hostbridge front end.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                    HOSTBRIDGE                     │
//!                        │                                                   │
//!     HTTP client or     │  ┌─────────┐    ┌──────────┐    ┌──────────────┐  │
//!     front web server ──┼─▶│   net   │───▶│  worker  │───▶│   routing    │  │
//!                        │  │acceptor │    │http/wire │    │ route table  │  │
//!                        │  └────▲────┘    └────┬─────┘    └──────┬───────┘  │
//!                        │       │ keep-alive   │                 │          │
//!                        │       └──────────────┤                 ▼          │
//!                        │                 ┌────┴─────┐    ┌──────────────┐  │
//!                        │                 │  broker  │◀───│   backend    │◀─┼──── Backend
//!                        │                 │ by req id│    │   context    │  │     process
//!                        │                 └──────────┘    └──────────────┘  │
//!                        │                                                   │
//!                        │  config · lifecycle · observability               │
//!                        └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use hostbridge::config::{read_config, validate_config, ConfigError, GatewayConfig};
use hostbridge::lifecycle::spawn_signal_handler;
use hostbridge::net::Listener;
use hostbridge::observability::{logging, metrics};
use hostbridge::worker::Transport;
use hostbridge::Gateway;

#[derive(Parser, Debug)]
#[command(name = "hostbridge", version, about = "Relay HTTP requests to backend application processes")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Route list `[[host:]port:]prefix:target`, comma separated; appended
    /// to the configured routes.
    #[arg(short, long)]
    applications: Option<String>,

    /// Bind address (`host:port` or `unix:/path`).
    #[arg(short, long)]
    listen: Option<String>,

    /// Client protocol: `http` or `wire`.
    #[arg(short, long)]
    transport: Option<Transport>,

    /// Default backend endpoint (`host:port` or `unix:/path`).
    #[arg(short, long)]
    backend: Option<String>,

    /// Log level override.
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut GatewayConfig) {
        if let Some(list) = self.applications {
            if config.applications.trim().is_empty() {
                config.applications = list;
            } else {
                config.applications = format!("{},{}", config.applications, list);
            }
        }
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(transport) = self.transport {
            config.listener.transport = transport;
        }
        if let Some(backend) = self.backend {
            config.backend.endpoint = Some(backend);
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => read_config(path)?,
        None => GatewayConfig::default(),
    };
    args.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hostbridge starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        transport = config.listener.transport.as_str(),
        max_connections = config.listener.max_connections,
        backend = ?config.backend.endpoint,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let gateway = Gateway::with_remote_backends(config)?;
    spawn_signal_handler(gateway.shutdown_handle());

    gateway.run(listener).await;
    Ok(())
}
