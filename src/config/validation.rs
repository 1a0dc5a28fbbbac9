//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check that every route can reach a backend
//! - Detect conflicting routes
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use super::schema::GatewayConfig;
use crate::backend::Endpoint;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let bind = &config.listener.bind_address;
    match bind.strip_prefix("unix:") {
        Some(path) if path.is_empty() => {
            errors.push(ValidationError::new("listener.bind_address", "empty unix socket path"));
        }
        Some(_) => {}
        None => {
            if bind.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::new(
                    "listener.bind_address",
                    format!("'{bind}' is not a socket address"),
                ));
            }
        }
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }

    let timeouts = &config.timeouts;
    if timeouts.idle_secs == 0 {
        errors.push(ValidationError::new("timeouts.idle_secs", "must be greater than 0"));
    }
    if timeouts.io_secs == 0 {
        errors.push(ValidationError::new("timeouts.io_secs", "must be greater than 0"));
    }
    if timeouts.max_linger_secs < timeouts.linger_secs {
        errors.push(ValidationError::new(
            "timeouts.max_linger_secs",
            "must not be shorter than linger_secs",
        ));
    }

    let backend = &config.backend;
    if let Some(endpoint) = &backend.endpoint {
        if Endpoint::parse(endpoint).is_err() {
            errors.push(ValidationError::new(
                "backend.endpoint",
                format!("'{endpoint}' is neither host:port nor unix:/path"),
            ));
        }
    }
    if backend.connect_attempts == 0 {
        errors.push(ValidationError::new("backend.connect_attempts", "must be at least 1"));
    }
    if backend.connect_timeout_secs == 0 {
        errors.push(ValidationError::new("backend.connect_timeout_secs", "must be greater than 0"));
    }

    validate_routes(config, &mut errors);

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", observability.log_level),
        ));
    }
    if !matches!(observability.log_format.as_str(), "text" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "expected \"text\" or \"json\"",
        ));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_routes(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    for (i, route) in config.routes.iter().enumerate() {
        if !route.prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("routes[{i}].prefix"),
                format!("'{}' must start with '/'", route.prefix),
            ));
        }
        if let Some(endpoint) = &route.endpoint {
            if Endpoint::parse(endpoint).is_err() {
                errors.push(ValidationError::new(
                    format!("routes[{i}].endpoint"),
                    format!("'{endpoint}' is neither host:port nor unix:/path"),
                ));
            }
        }
    }

    let specs = match config.route_specs() {
        Ok(specs) => specs,
        Err(e) => {
            errors.push(ValidationError::new("applications", e.to_string()));
            return;
        }
    };

    let mut seen = HashSet::new();
    for spec in &specs {
        let key = (
            spec.host.as_ref().map(|h| h.to_lowercase()),
            spec.port,
            spec.prefix.clone(),
        );
        if !seen.insert(key) {
            errors.push(ValidationError::new(
                "routes",
                format!("duplicate route {:?}:{:?}:{}", spec.host, spec.port, spec.prefix),
            ));
        }
        if spec.endpoint.is_none() && config.backend.endpoint.is_none() {
            errors.push(ValidationError::new(
                "backend.endpoint",
                format!("route {} has no endpoint and no default is set", spec.prefix),
            ));
        }
    }
}
