//! Per-connection request workers.
//!
//! # Data Flow
//! ```text
//! Acceptor (connection readable)
//!     → Dispatcher::dispatch
//!     → http.rs | wire.rs (parse the request, route it)
//!     → RequestBroker::register → BackendContext::begin_request
//!     → backend drives the worker through the broker
//!     → RequestBroker::unregister
//!     → ReusePool (keep-alive) | linger.rs (close)
//! ```
//!
//! # Design Decisions
//! - One task per request; the worker owns its socket for the duration
//! - Backends see the worker only through `RequestIo`/`ResponseControl`
//! - Failures end at the worker: unregister, answer if possible, close

pub mod http;
pub mod linger;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use linger::{linger_close, LingerConfig};

use crate::backend::BackendError;
use crate::broker::RequestBroker;
use crate::net::{Connection, Dispatch, ReusePool};
use crate::protocol::ProtocolError;
use crate::routing::RouteTable;

/// Protocol spoken by clients of the listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain HTTP/1.x clients.
    #[default]
    Http,
    /// A front web server relaying requests over the wire protocol.
    Wire,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Wire => "wire",
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "wire" => Ok(Self::Wire),
            other => Err(format!("unknown transport '{other}' (expected http or wire)")),
        }
    }
}

/// Where a worker is in its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Accepted,
    ReadingRequestLine,
    Routed,
    Dispatched,
    HeadersSent,
    Closing,
    Closed,
    /// No route matched; terminal.
    Rejected,
}

impl WorkerState {
    /// Whether `next` may follow `self`.
    pub fn can_advance_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Closed | Rejected, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (Accepted, ReadingRequestLine)
            | (ReadingRequestLine, Routed)
            | (Routed, Dispatched | Rejected)
            | (Dispatched, HeadersSent) => true,
            _ => false,
        }
    }
}

/// State tracker that logs each transition.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: WorkerState,
    connection: crate::net::ConnectionId,
}

impl Lifecycle {
    pub(crate) fn new(connection: crate::net::ConnectionId) -> Self {
        Self {
            state: WorkerState::Accepted,
            connection,
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: WorkerState) {
        if self.state == next {
            return;
        }
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                connection_id = %self.connection,
                from = ?self.state,
                to = ?next,
                "Invalid worker state transition"
            );
            return;
        }
        tracing::trace!(connection_id = %self.connection, from = ?self.state, to = ?next, "Worker state");
        self.state = next;
    }
}

/// Ways a request can fail inside a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u8, actual: u8 },

    #[error("malformed request: {0}")]
    MalformedRequestLine(String),

    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error("backend fault: {0}")]
    BackendFault(#[from] BackendError),

    #[error("connection idle too long")]
    IdleTimeout,

    #[error("protocol violation: {0}")]
    OversizedField(ProtocolError),

    #[error("protocol failure: {0}")]
    Protocol(ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for WorkerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::VersionMismatch { expected, actual } => {
                Self::ProtocolVersionMismatch { expected, actual }
            }
            ProtocolError::OversizedField { .. } => Self::OversizedField(err),
            ProtocolError::Io(e) => Self::Io(e),
            other => Self::Protocol(other),
        }
    }
}

impl WorkerError {
    /// Failures worth a warning; the rest are routine client behaviour.
    pub fn is_notable(&self) -> bool {
        matches!(
            self,
            Self::ProtocolVersionMismatch { .. }
                | Self::BackendFault(_)
                | Self::OversizedField(_)
                | Self::Protocol(_)
        )
    }
}

/// Bound a socket operation by `limit`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    operation: impl std::future::Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    tokio::time::timeout(limit, operation).await.map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "socket operation timed out")
    })?
}

/// Worker tuning shared by every request.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Bound on each socket read or write.
    pub io_timeout: Duration,
    pub keep_alive: bool,
    /// Advertised in the `Keep-Alive` response header.
    pub keep_alive_timeout_secs: u64,
    pub linger: LingerConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(15),
            keep_alive: true,
            keep_alive_timeout_secs: 15,
            linger: LingerConfig::default(),
        }
    }
}

/// State shared by all workers of one listener.
pub struct WorkerShared {
    pub routes: Arc<RouteTable>,
    pub broker: Arc<RequestBroker>,
    pub pool: ReusePool,
    pub settings: WorkerSettings,
    /// Fired when a wire peer asks the server to stop.
    pub shutdown: broadcast::Sender<()>,
}

impl WorkerShared {
    /// Keep the connection for another request, or close it.
    pub(crate) async fn finish(&self, conn: Connection, keep_alive: bool) {
        let conn = if keep_alive {
            match self.pool.recycle(conn) {
                Ok(()) => return,
                Err(conn) => conn,
            }
        } else {
            conn
        };
        linger_close(conn, self.settings.linger).await;
    }
}

/// Routes readable connections to the worker for the listener's transport.
pub struct Dispatcher {
    transport: Transport,
    shared: Arc<WorkerShared>,
}

impl Dispatcher {
    pub fn new(transport: Transport, shared: Arc<WorkerShared>) -> Self {
        Self { transport, shared }
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, conn: Connection) {
        match self.transport {
            Transport::Http => http::serve(conn, &self.shared).await,
            Transport::Wire => wire::serve(conn, &self.shared).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use WorkerState::*;

    #[rstest]
    #[case(Accepted, ReadingRequestLine, true)]
    #[case(ReadingRequestLine, Routed, true)]
    #[case(Routed, Rejected, true)]
    #[case(Routed, Dispatched, true)]
    #[case(Dispatched, HeadersSent, true)]
    #[case(HeadersSent, Closing, true)]
    #[case(Closing, Closed, true)]
    #[case(ReadingRequestLine, Closing, true)]
    #[case(Rejected, Closing, false)]
    #[case(Closed, Accepted, false)]
    #[case(Accepted, Dispatched, false)]
    #[case(HeadersSent, Dispatched, false)]
    fn state_transitions(#[case] from: WorkerState, #[case] to: WorkerState, #[case] allowed: bool) {
        assert_eq!(from.can_advance_to(to), allowed);
    }

    #[test]
    fn protocol_errors_map_to_worker_errors() {
        let err = WorkerError::from(ProtocolError::VersionMismatch {
            expected: 9,
            actual: 7,
        });
        assert!(matches!(
            err,
            WorkerError::ProtocolVersionMismatch {
                expected: 9,
                actual: 7
            }
        ));

        let err = WorkerError::from(ProtocolError::OversizedField {
            field: "uri",
            length: 1 << 20,
            max: 10240,
        });
        assert!(matches!(err, WorkerError::OversizedField(_)));
        assert!(err.is_notable());
        assert!(!WorkerError::IdleTimeout.is_notable());
    }

    #[test]
    fn transport_parses_case_insensitively() {
        assert_eq!("HTTP".parse::<Transport>(), Ok(Transport::Http));
        assert_eq!("wire".parse::<Transport>(), Ok(Transport::Wire));
        assert!("ajp".parse::<Transport>().is_err());
    }
}
