//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::routing::{parse_applications, RouteError, RouteSpec};
use crate::worker::Transport;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, transport).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Connection reuse settings.
    pub keep_alive: KeepAliveConfig,

    /// Default backend process settings.
    pub backend: BackendConfig,

    /// Route table entries.
    pub routes: Vec<RouteSpec>,

    /// Additional routes in list form: `[[host:]port:]prefix:target`,
    /// comma separated.
    pub applications: String,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Every configured route, table entries first, then the application
    /// list. Prefixes are normalised to end in `/`.
    pub fn route_specs(&self) -> Result<Vec<RouteSpec>, RouteError> {
        let mut specs: Vec<RouteSpec> = self
            .routes
            .iter()
            .cloned()
            .map(|mut spec| {
                spec.prefix = crate::routing::parse::normalize_prefix(&spec.prefix);
                spec
            })
            .collect();
        specs.extend(parse_applications(&self.applications)?);
        Ok(specs)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080" or "unix:/run/hostbridge.sock").
    pub bind_address: String,

    /// Protocol spoken by clients.
    pub transport: Transport,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            transport: Transport::Http,
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Parked connections idle longer than this are closed.
    pub idle_secs: u64,

    /// Bound on each socket read or write.
    pub io_secs: u64,

    /// Longest wait for a single read while lingering on close.
    pub linger_secs: u64,

    /// Longest total lingering time.
    pub max_linger_secs: u64,

    /// How long shutdown waits for in-flight requests.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 15,
            io_secs: 15,
            linger_secs: 2,
            max_linger_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn io(&self) -> Duration {
        Duration::from_secs(self.io_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Connection reuse settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,

    /// Requests a connection may carry after its first.
    pub max_reuses: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reuses: 100,
        }
    }
}

/// Default backend process settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Endpoint for routes without their own (`host:port` or `unix:/path`).
    pub endpoint: Option<String>,

    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Idle channels kept per backend.
    pub max_idle_channels: usize,

    /// Connect tries before a backend counts as unavailable.
    pub connect_attempts: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: 5,
            max_idle_channels: 8,
            connect_attempts: 3,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("text" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
