//! Wire transport worker.
//!
//! The peer is a front web server that forwards requests over the wire
//! protocol and serves the responses itself. Each backend operation becomes
//! a command on the peer's connection; the connection stays open between
//! requests.

use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{Lifecycle, WorkerError, WorkerShared, WorkerState};
use crate::backend::BeginRequest;
use crate::broker::{RequestId, RequestIo, ResponseControl};
use crate::http::request::split_host_port;
use crate::net::{Connection, DetachedConnection, Stream};
use crate::observability::metrics;
use crate::protocol::{HandlerChannel, HandlerSession, Inbound, InitialRequest, ProtocolError};
use crate::routing::RouteMatch;

/// Serve one wire exchange from `conn`.
pub(crate) async fn serve(conn: Connection, shared: &WorkerShared) {
    let started = Instant::now();
    let settings = shared.settings;
    let mut lifecycle = Lifecycle::new(conn.id());
    lifecycle.advance(WorkerState::ReadingRequestLine);

    let (stream, buffer, detached) = conn.detach();
    let channel = HandlerChannel::with_read_buffer(stream, buffer);

    let inbound = match tokio::time::timeout(settings.io_timeout, channel.accept()).await {
        Ok(Ok(inbound)) => inbound,
        Ok(Err(err)) => {
            metrics::record_protocol_error(err.kind());
            let err = WorkerError::from(err);
            if err.is_notable() {
                tracing::warn!(connection_id = %detached.id(), error = %err, "Closing wire connection");
            } else {
                tracing::debug!(connection_id = %detached.id(), error = %err, "Wire connection closed");
            }
            return;
        }
        Err(_) => {
            tracing::debug!(connection_id = %detached.id(), error = %WorkerError::IdleTimeout, "Wire connection closed");
            return;
        }
    };

    let session = match inbound {
        Inbound::Request(session) => session,
        Inbound::Shutdown => {
            tracing::info!(connection_id = %detached.id(), "Shutdown requested by wire peer");
            let _ = shared.shutdown.send(());
            return;
        }
        Inbound::Closed => return,
    };

    lifecycle.advance(WorkerState::Routed);
    let (host, port) = route_host(session.request());
    let path = routing_path(&session.request().uri);
    let found = shared
        .routes
        .match_route(host.as_deref(), port, &path, false);

    let entry = match found {
        Some(RouteMatch::Found(entry)) => entry,
        // The front server owns redirects; a bare application root is not ours.
        Some(RouteMatch::Redirect(_)) | None => {
            lifecycle.advance(WorkerState::Rejected);
            let err = WorkerError::RouteNotFound(path);
            tracing::debug!(connection_id = %detached.id(), error = %err, "Request rejected");
            metrics::record_request("wire", 404, started);
            let channel = bounded_protocol(settings.io_timeout, session.not_found()).await;
            reuse(channel, detached, shared).await;
            return;
        }
    };

    let context = match shared.routes.resolve(&entry).await {
        Ok(context) => context,
        Err(err) => {
            let err = WorkerError::BackendFault(err);
            tracing::warn!(connection_id = %detached.id(), prefix = %entry.prefix(), error = %err, "Backend context unavailable");
            lifecycle.advance(WorkerState::Closing);
            metrics::record_request("wire", 500, started);
            let channel = server_error(session, settings.io_timeout).await;
            reuse(channel, detached, shared).await;
            return;
        }
    };

    lifecycle.advance(WorkerState::Dispatched);
    let exchange = Arc::new(WireExchange::new(session, settings.io_timeout));
    let worker: Arc<dyn RequestIo> = exchange.clone();

    let result = match shared.broker.register(worker) {
        Ok(id) => {
            let request = exchange.begin_request(id, &entry.spec().target, host.unwrap_or_default());
            tracing::debug!(
                connection_id = %detached.id(),
                request_id = %id,
                verb = %request.verb,
                path = %request.path,
                "Request dispatched"
            );
            let result = context.begin_request(request).await;
            shared.broker.unregister(id);
            result
        }
        Err(err) => Err(err.into()),
    };

    let failed = match result {
        Ok(()) => false,
        Err(err) => {
            if err.is_context_fatal() {
                entry.clear_context().await;
            }
            let err = WorkerError::BackendFault(err);
            tracing::warn!(connection_id = %detached.id(), error = %err, "Request failed");
            true
        }
    };

    if exchange.headers_sent().await {
        lifecycle.advance(WorkerState::HeadersSent);
    }
    lifecycle.advance(WorkerState::Closing);
    let (channel, status) = exchange.finish(failed).await;
    metrics::record_request("wire", status, started);
    reuse(channel, detached, shared).await;
    lifecycle.advance(WorkerState::Closed);
}

/// Host and port to route on: the virtual server name if the peer sent one,
/// else the `Host` header. The port comes from `Host`, defaulting to 80.
fn route_host(request: &InitialRequest) -> (Option<String>, Option<u16>) {
    let from_header = request.header("Host").map(|h| split_host_port(h, 80));
    let port = from_header.as_ref().map(|(_, port)| *port);
    let host = if request.virtual_server.is_empty() {
        from_header.map(|(host, _)| host)
    } else {
        Some(request.virtual_server.to_lowercase())
    };
    (host, port)
}

/// Drop path info after the last dotted segment: `/app/page.aspx/extra`
/// routes as `/app/page.aspx`.
pub(crate) fn routing_path(uri: &str) -> String {
    if let Some(dot) = uri.rfind('.') {
        if dot > 0 {
            if let Some(slash) = uri[dot..].find('/') {
                return uri[..dot + slash].to_string();
            }
        }
    }
    uri.to_string()
}

async fn bounded_protocol<T>(
    limit: Duration,
    operation: impl std::future::Future<Output = Result<T, ProtocolError>>,
) -> Result<T, ProtocolError> {
    tokio::time::timeout(limit, operation).await.map_err(|_| {
        ProtocolError::Io(io::Error::new(io::ErrorKind::TimedOut, "wire operation timed out"))
    })?
}

async fn server_error(
    mut session: HandlerSession<Stream>,
    limit: Duration,
) -> Result<HandlerChannel<Stream>, ProtocolError> {
    let body = Bytes::from_static(
        b"<html><head><title>500 Server Error</title></head><body><h1>Server error</h1></body></html>\r\n",
    );
    bounded_protocol(limit, async move {
        session.set_status(500, "500 Internal Server Error").await?;
        session.set_response_header("Content-Type", "text/html");
        session.set_response_header("Content-Length", body.len().to_string());
        session.send_bytes(body).await?;
        session.close().await
    })
    .await
}

/// Hand the peer's connection back for its next exchange, or drop it if the
/// exchange left it unusable.
async fn reuse(
    channel: Result<HandlerChannel<Stream>, ProtocolError>,
    detached: DetachedConnection,
    shared: &WorkerShared,
) {
    match channel {
        Ok(channel) => {
            let (stream, buffer) = channel.into_parts();
            let conn = detached.reattach(stream, buffer);
            shared.finish(conn, shared.settings.keep_alive).await;
        }
        Err(err) => {
            metrics::record_protocol_error(err.kind());
            tracing::debug!(connection_id = %detached.id(), error = %err, "Wire connection dropped");
        }
    }
}

enum Slot {
    Active(HandlerSession<Stream>),
    Finished(HandlerChannel<Stream>),
    Failed(ProtocolError),
    /// Transitional while a terminal command is in flight.
    Empty,
}

/// One wire request shared between the worker and the backend.
pub struct WireExchange {
    slot: Mutex<Slot>,
    request: InitialRequest,
    io_timeout: Duration,
    /// Last status the backend set, for metrics.
    status: AtomicU16,
}

impl WireExchange {
    fn new(session: HandlerSession<Stream>, io_timeout: Duration) -> Self {
        Self {
            request: session.request().clone(),
            slot: Mutex::new(Slot::Active(session)),
            io_timeout,
            status: AtomicU16::new(200),
        }
    }

    fn begin_request(&self, id: RequestId, physical_path: &str, virtual_server: String) -> BeginRequest {
        let request = &self.request;
        BeginRequest {
            id,
            verb: request.verb.clone(),
            path: request.uri.clone(),
            query_string: request.query_string.clone(),
            protocol: request.protocol.clone(),
            local_address: request.local_address.clone(),
            server_port: u16::try_from(request.server_port).unwrap_or(0),
            remote_address: request.remote_address.clone(),
            remote_port: u16::try_from(request.remote_port).unwrap_or(0),
            remote_name: request.remote_name.clone(),
            headers: request.headers.clone(),
            virtual_server,
            physical_path: Some(
                request
                    .physical_path
                    .clone()
                    .unwrap_or_else(|| physical_path.to_string()),
            ),
        }
    }

    /// End the exchange. Returns the channel for the next exchange and the
    /// status to report.
    async fn finish(&self, failed: bool) -> (Result<HandlerChannel<Stream>, ProtocolError>, u16) {
        let mut slot = self.slot.lock().await;
        let status = self.status.load(Ordering::Relaxed);
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Active(session) if failed && !session.headers_sent() => {
                (server_error(session, self.io_timeout).await, 500)
            }
            Slot::Active(session) => (bounded_protocol(self.io_timeout, session.close()).await, status),
            Slot::Finished(channel) => (Ok(channel), status),
            Slot::Failed(err) => (Err(err), 500),
            Slot::Empty => (Err(ProtocolError::Unexpected("exchange finished twice")), 500),
        }
    }

    /// Run `call` on the live session. A protocol failure poisons the
    /// exchange.
    async fn with_session<T, F>(&self, call: F) -> io::Result<T>
    where
        F: for<'s> FnOnce(
            &'s mut HandlerSession<Stream>,
        ) -> futures_util::future::BoxFuture<'s, Result<T, ProtocolError>>,
    {
        let mut slot = self.slot.lock().await;
        let Slot::Active(session) = &mut *slot else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "request already finished"));
        };
        match bounded_protocol(self.io_timeout, call(session)).await {
            Ok(value) => Ok(value),
            Err(err) => {
                let reported = io::Error::other(err.to_string());
                *slot = Slot::Failed(err);
                Err(reported)
            }
        }
    }

    /// Send a terminal command and keep the channel for reuse.
    async fn end_with(&self, not_found: bool) {
        let mut slot = self.slot.lock().await;
        let Slot::Active(session) = std::mem::replace(&mut *slot, Slot::Empty) else {
            return;
        };
        if not_found {
            self.status.store(404, Ordering::Relaxed);
        }
        let ended = if not_found {
            bounded_protocol(self.io_timeout, session.not_found()).await
        } else {
            bounded_protocol(self.io_timeout, session.decline()).await
        };
        *slot = match ended {
            Ok(channel) => Slot::Finished(channel),
            Err(err) => Slot::Failed(err),
        };
    }
}

#[async_trait]
impl RequestIo for WireExchange {
    async fn read(&self, size: usize) -> io::Result<Bytes> {
        self.with_session(|s| Box::pin(s.read_body(size))).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let data = Bytes::copy_from_slice(data);
        match self.with_session(|s| Box::pin(s.send_bytes(data))).await {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    async fn close(&self) {
        let mut slot = self.slot.lock().await;
        let Slot::Active(session) = std::mem::replace(&mut *slot, Slot::Empty) else {
            return;
        };
        *slot = match bounded_protocol(self.io_timeout, session.close()).await {
            Ok(channel) => Slot::Finished(channel),
            Err(err) => Slot::Failed(err),
        };
    }

    async fn is_connected(&self) -> bool {
        self.with_session(|s| Box::pin(s.is_connected()))
            .await
            .unwrap_or(false)
    }

    fn control(&self) -> Option<&dyn ResponseControl> {
        Some(self)
    }
}

#[async_trait]
impl ResponseControl for WireExchange {
    async fn set_status(&self, code: u16, reason: &str) {
        self.status.store(code, Ordering::Relaxed);
        let status_line = format!("{code} {reason}");
        let _ = self
            .with_session(|s| Box::pin(s.set_status(i32::from(code), status_line)))
            .await;
    }

    async fn set_response_header(&self, name: &str, value: &str) {
        if let Slot::Active(session) = &mut *self.slot.lock().await {
            session.set_response_header(name, value);
        }
    }

    async fn server_variable(&self, name: &str) -> Option<String> {
        let name = name.to_string();
        self.with_session(|s| Box::pin(s.server_variable(name)))
            .await
            .ok()
            .flatten()
    }

    async fn send_file(&self, path: &str) -> io::Result<()> {
        let path = path.to_string();
        self.with_session(|s| Box::pin(s.send_file(path))).await
    }

    fn local_port(&self) -> u16 {
        u16::try_from(self.request.server_port).unwrap_or(0)
    }

    async fn headers_sent(&self) -> bool {
        match &*self.slot.lock().await {
            Slot::Active(session) => session.headers_sent(),
            _ => true,
        }
    }

    async fn decline(&self) {
        self.end_with(false).await;
    }

    async fn not_found(&self) {
        self.end_with(true).await;
    }

    async fn set_output_buffering(&self, enabled: bool) {
        if let Slot::Active(session) = &mut *self.slot.lock().await {
            session.set_output_buffering(enabled);
        }
    }
}
