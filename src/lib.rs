//! Hostbridge: a front end that relays HTTP requests to backend
//! application processes.
//!
//! Clients speak plain HTTP/1.x, or a front web server relays them over the
//! binary wire protocol. Each request is routed by host, port and path
//! prefix to a backend context, which drives the response through the
//! request broker.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod protocol;
pub mod routing;

// Request execution
pub mod backend;
pub mod broker;
pub mod worker;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub mod server;

pub use config::GatewayConfig;
pub use lifecycle::Shutdown;
pub use server::{Gateway, GatewayError};
