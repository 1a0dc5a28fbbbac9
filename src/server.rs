//! Gateway assembly.
//!
//! # Responsibilities
//! - Build the route table from configuration
//! - Wire the acceptor, reuse pool and workers together
//! - Run until shutdown, then drain workers and unload backend contexts

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::backend::channel::ChannelSettings;
use crate::backend::{BackendError, ContextFactory, Endpoint, RemoteContextFactory};
use crate::broker::RequestBroker;
use crate::config::GatewayConfig;
use crate::lifecycle::Shutdown;
use crate::net::{Acceptor, AcceptorConfig, ConnectionTracker, Listener, ReusePool};
use crate::routing::{RouteError, RouteTable};
use crate::worker::{Dispatcher, LingerConfig, WorkerSettings, WorkerShared};

/// Errors assembling the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("route configuration: {0}")]
    Route(#[from] RouteError),

    #[error("backend configuration: {0}")]
    Backend(#[from] BackendError),
}

/// The front end: one listener, one route table, one broker.
pub struct Gateway {
    config: GatewayConfig,
    routes: Arc<RouteTable>,
    broker: Arc<RequestBroker>,
    shutdown: Shutdown,
    /// Subscribed at construction so a trigger before `run` is not lost.
    stop: broadcast::Receiver<()>,
}

impl Gateway {
    /// Register every configured route with `factory` creating contexts.
    pub fn new(
        config: GatewayConfig,
        broker: Arc<RequestBroker>,
        factory: Arc<dyn ContextFactory>,
    ) -> Result<Self, GatewayError> {
        let routes = Arc::new(RouteTable::new(factory));
        for spec in config.route_specs()? {
            routes.register(spec)?;
        }
        tracing::info!(routes = routes.len(), "Route table built");

        let shutdown = Shutdown::new();
        let stop = shutdown.subscribe();
        Ok(Self {
            config,
            routes,
            broker,
            shutdown,
            stop,
        })
    }

    /// Serve every route through backend processes reached over the wire
    /// protocol.
    pub fn with_remote_backends(config: GatewayConfig) -> Result<Self, GatewayError> {
        let broker = Arc::new(RequestBroker::new());
        let default_endpoint = config
            .backend
            .endpoint
            .as_deref()
            .map(Endpoint::parse)
            .transpose()?;
        let settings = ChannelSettings {
            connect_timeout: Duration::from_secs(config.backend.connect_timeout_secs),
            max_idle: config.backend.max_idle_channels,
            connect_attempts: config.backend.connect_attempts,
            ..ChannelSettings::default()
        };
        let factory = Arc::new(RemoteContextFactory::new(
            Arc::clone(&broker),
            default_endpoint,
            settings,
        ));
        Self::new(config, broker, factory)
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn broker(&self) -> &Arc<RequestBroker> {
        &self.broker
    }

    /// Handle that stops [`Gateway::run`] when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    fn worker_settings(&self) -> WorkerSettings {
        worker_settings(&self.config)
    }

    /// Serve `listener` until shutdown is triggered, by signal or by a wire
    /// peer. In-flight workers get the configured grace period.
    pub async fn run(self, listener: Listener) {
        let Self {
            config,
            routes,
            broker,
            shutdown,
            stop,
        } = self;
        routes.seal();

        let (pool, returned) = ReusePool::channel(config.keep_alive.max_reuses);
        let shared = Arc::new(WorkerShared {
            routes: Arc::clone(&routes),
            broker: Arc::clone(&broker),
            pool,
            settings: worker_settings(&config),
            shutdown: shutdown.sender(),
        });
        let transport = config.listener.transport;
        let dispatcher = Arc::new(Dispatcher::new(transport, shared));
        let tracker = ConnectionTracker::new();
        let acceptor = Acceptor::new(
            listener,
            returned,
            dispatcher,
            tracker.clone(),
            AcceptorConfig {
                idle_timeout: config.timeouts.idle(),
                ..AcceptorConfig::default()
            },
        );

        tracing::info!(
            transport = transport.as_str(),
            keep_alive = config.keep_alive.enabled,
            max_reuses = config.keep_alive.max_reuses,
            "Gateway serving"
        );
        acceptor.run(stop).await;

        let grace = config.timeouts.shutdown_grace();
        if tracker.wait_for_shutdown(grace).await {
            tracing::info!("All workers finished");
        } else {
            tracing::warn!(
                remaining = tracker.active_count(),
                grace_secs = grace.as_secs(),
                "Workers still running after grace period"
            );
        }
        routes.unload_all().await;
        tracing::info!("Gateway stopped");
    }
}

fn worker_settings(config: &GatewayConfig) -> WorkerSettings {
    let timeouts = &config.timeouts;
    WorkerSettings {
        io_timeout: timeouts.io(),
        keep_alive: config.keep_alive.enabled,
        keep_alive_timeout_secs: timeouts.idle_secs,
        linger: LingerConfig {
            per_read: Duration::from_secs(timeouts.linger_secs),
            total: Duration::from_secs(timeouts.max_linger_secs),
            ..LingerConfig::default()
        },
    }
}
