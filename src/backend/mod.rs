//! Backend execution contexts.
//!
//! # Data Flow
//! ```text
//! Route entry (first match)
//!     → ContextFactory::create(route) (once per entry)
//!     → Arc<dyn BackendContext>
//!
//! Worker
//!     → BackendContext::begin_request(BeginRequest)
//!         → RemoteContext: ChannelPool checkout
//!         → InitialRequest over the wire
//!         → commands resolved through RequestBroker back to the worker
//!         → channel returned on Close
//! ```
//!
//! # Design Decisions
//! - The front end never links application code; contexts are reached
//!   through the wire protocol
//! - Contexts address the worker only through its request id

pub mod channel;
pub mod endpoint;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use endpoint::Endpoint;
pub use remote::{RemoteContext, RemoteContextFactory};

use crate::broker::{BrokerError, RequestId};
use crate::protocol::{InitialRequest, ProtocolError};
use crate::routing::RouteSpec;

/// Backend failures surfaced to the worker.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend process could not be reached.
    #[error("backend {endpoint} unavailable: {source}")]
    Unavailable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The channel to the backend misbehaved mid-request.
    #[error("backend protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("invalid backend endpoint '{0}'")]
    InvalidEndpoint(String),

    /// The context was unloaded while the request was queued.
    #[error("backend context unloaded")]
    Unloaded,
}

impl BackendError {
    /// The context itself is unusable and should be recreated.
    pub fn is_context_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Unloaded)
    }
}

/// Everything a backend needs to start processing a request.
#[derive(Debug, Clone, Default)]
pub struct BeginRequest {
    pub id: RequestId,
    pub verb: String,
    pub path: String,
    pub query_string: String,
    pub protocol: String,
    pub local_address: String,
    pub server_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub remote_name: String,
    /// Header pairs in arrival order.
    pub headers: Vec<(String, String)>,
    pub virtual_server: String,
    /// Physical application root of the matched route.
    pub physical_path: Option<String>,
}

impl BeginRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Wire form of the request metadata.
    pub fn to_initial(&self) -> InitialRequest {
        InitialRequest {
            verb: self.verb.clone(),
            virtual_server: self.virtual_server.clone(),
            uri: self.path.clone(),
            query_string: self.query_string.clone(),
            protocol: self.protocol.clone(),
            local_address: self.local_address.clone(),
            server_port: i32::from(self.server_port),
            remote_address: self.remote_address.clone(),
            remote_port: i32::from(self.remote_port),
            remote_name: self.remote_name.clone(),
            headers: self.headers.clone(),
            physical_path: self.physical_path.clone(),
        }
    }
}

/// An isolated execution context serving one route entry.
#[async_trait]
pub trait BackendContext: Send + Sync + std::fmt::Debug {
    /// Run one request to completion. All I/O for the request goes through
    /// the broker using `request.id`.
    async fn begin_request(&self, request: BeginRequest) -> Result<(), BackendError>;

    /// Release resources held by the context.
    async fn unload(&self) {}
}

/// Creates backend contexts for route entries on first use.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn create(&self, route: &RouteSpec) -> Result<Arc<dyn BackendContext>, BackendError>;
}
