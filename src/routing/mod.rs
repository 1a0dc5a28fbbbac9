//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route list / config entries (at startup)
//!     → parse.rs (RouteSpec per entry)
//!     → router.rs RouteTable::register (ordered)
//!     → seal() when the acceptor starts
//!
//! Incoming request (host, local port, path)
//!     → router.rs (reverse scan, longest prefix)
//!     → matcher.rs (host pattern, path prefix / redirect)
//!     → Return: Found | Redirect | None
//!     → RouteEntry::context (lazy, once per entry)
//! ```
//!
//! # Design Decisions
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same entry
//! - Lookups take a read lock; registration is a startup-only write

pub mod matcher;
pub mod parse;
pub mod router;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use matcher::{HostPattern, PathMatch};
pub use parse::{parse_application, parse_applications};
pub use router::{RouteEntry, RouteMatch, RouteTable};

/// Static description of a route entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteSpec {
    /// Host pattern (`name`, `*.suffix` or `*`); absent means any host.
    #[serde(default)]
    pub host: Option<String>,
    /// Local port; absent means any port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Virtual path prefix, starting with `/`.
    #[serde(alias = "path")]
    pub prefix: String,
    /// Physical application path handed to the backend.
    pub target: String,
    /// Backend endpoint overriding the default one.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Route registration and parsing errors.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route prefix '{0}' must start with '/'")]
    InvalidPrefix(String),

    #[error("route {host:?}:{port:?}:{prefix} is already registered")]
    Duplicate {
        host: Option<String>,
        port: Option<u16>,
        prefix: String,
    },

    /// Registration attempted after serving started.
    #[error("route table is sealed once serving has started")]
    Sealed,

    #[error("invalid route entry '{entry}': {reason}")]
    Parse { entry: String, reason: &'static str },

    #[error("invalid port '{port}' in route entry '{entry}'")]
    InvalidPort { entry: String, port: String },
}
