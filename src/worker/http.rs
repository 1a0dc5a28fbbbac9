//! HTTP transport worker.
//!
//! Serves one request read directly from a client socket. The backend drives
//! the response through [`RequestIo`] and [`ResponseControl`]; this worker
//! owns framing: the buffered head, `Content-Length` bounded body reads, and
//! the keep-alive decision.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{bounded, Lifecycle, WorkerError, WorkerShared, WorkerState};
use crate::backend::BeginRequest;
use crate::broker::{RequestId, RequestIo, ResponseControl};
use crate::http::request::{read_request_head, redirect_location, HeadError, RequestHead};
use crate::http::response::{
    self, client_wants_keep_alive, ConnectionPolicy, ResponseHead, SERVER_SOFTWARE,
};
use crate::net::{Connection, PeerAddr};
use crate::observability::metrics;
use crate::routing::RouteMatch;

/// Unread request bodies up to this size are drained so the socket can be
/// reused; larger ones close the connection.
const MAX_DRAIN: u64 = 64 * 1024;

const FILE_CHUNK: usize = 64 * 1024;

/// Serve one request from `conn`, then recycle or close it.
pub(crate) async fn serve(mut conn: Connection, shared: &WorkerShared) {
    let started = Instant::now();
    let settings = shared.settings;
    let mut lifecycle = Lifecycle::new(conn.id());
    lifecycle.advance(WorkerState::ReadingRequestLine);

    let head = {
        let (stream, buffer) = conn.io_mut();
        match read_request_head(stream, buffer, settings.io_timeout).await {
            Ok(head) => head,
            Err(err) => {
                lifecycle.advance(WorkerState::Closing);
                reject_head(conn, err, shared).await;
                return;
            }
        }
    };
    conn.touch();

    lifecycle.advance(WorkerState::Routed);
    let host = head.host();
    let port = match conn.local() {
        PeerAddr::Tcp(addr) => Some(addr.port()),
        PeerAddr::Local => None,
    };
    let keep_alive_requested = settings.keep_alive && client_wants_keep_alive(&head);
    let policy = ConnectionPolicy {
        keep_alive: keep_alive_requested,
        remaining: shared.pool.remaining_budget(&conn),
        timeout_secs: settings.keep_alive_timeout_secs,
    };

    let entry = match shared
        .routes
        .match_route(host.as_deref(), port, &head.path, true)
    {
        Some(RouteMatch::Found(entry)) => entry,
        Some(RouteMatch::Redirect(entry)) => {
            let location = redirect_location(entry.prefix(), &head.query_string);
            tracing::debug!(path = %head.path, location = %location, "Redirecting to application root");
            let bytes = response::redirect_response(&head.protocol, &location, policy);
            let reusable = policy.keep_alive
                && policy.remaining > 0
                && head.content_length().unwrap_or(0) == 0;
            let written = respond(&mut conn, &bytes, settings.io_timeout).await.is_ok();
            metrics::record_request("http", 301, started);
            lifecycle.advance(WorkerState::Closing);
            shared.finish(conn, reusable && written).await;
            return;
        }
        None => {
            lifecycle.advance(WorkerState::Rejected);
            let err = WorkerError::RouteNotFound(head.uri());
            tracing::debug!(connection_id = %conn.id(), error = %err, "Request rejected");
            let _ = respond(&mut conn, &response::not_found_page(&head.uri()), settings.io_timeout).await;
            metrics::record_request("http", 404, started);
            shared.finish(conn, false).await;
            return;
        }
    };

    let context = match shared.routes.resolve(&entry).await {
        Ok(context) => context,
        Err(err) => {
            let err = WorkerError::BackendFault(err);
            tracing::warn!(connection_id = %conn.id(), prefix = %entry.prefix(), error = %err, "Backend context unavailable");
            lifecycle.advance(WorkerState::Closing);
            let _ = respond(&mut conn, response::server_error_page(), settings.io_timeout).await;
            metrics::record_request("http", 500, started);
            shared.finish(conn, false).await;
            return;
        }
    };

    lifecycle.advance(WorkerState::Dispatched);
    let connection_id = conn.id();
    let exchange = Arc::new(HttpExchange::new(conn, head, policy, settings.io_timeout));
    let worker: Arc<dyn RequestIo> = exchange.clone();

    let result = match shared.broker.register(worker) {
        Ok(id) => {
            let request = exchange.begin_request(id, &entry.spec().target);
            tracing::debug!(
                connection_id = %connection_id,
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
            tracing::warn!(connection_id = %connection_id, error = %err, "Request failed");
            true
        }
    };

    if exchange.headers_sent().await {
        lifecycle.advance(WorkerState::HeadersSent);
    }
    lifecycle.advance(WorkerState::Closing);
    let (conn, status, keep_alive) = exchange.finish(failed).await;
    metrics::record_request("http", status, started);
    if let Some(conn) = conn {
        shared.finish(conn, keep_alive).await;
    }
    lifecycle.advance(WorkerState::Closed);
}

async fn reject_head(mut conn: Connection, err: HeadError, shared: &WorkerShared) {
    let err = match err {
        // Keep-alive client went away between requests.
        HeadError::Closed => return,
        HeadError::TimedOut => WorkerError::IdleTimeout,
        HeadError::LineTooLong => {
            let _ = respond(&mut conn, response::bad_request_page(), shared.settings.io_timeout).await;
            WorkerError::MalformedRequestLine("line too long".to_string())
        }
        HeadError::Malformed(reason) => WorkerError::MalformedRequestLine(reason.to_string()),
        HeadError::Io(e) => WorkerError::Io(e),
    };
    tracing::debug!(connection_id = %conn.id(), error = %err, "Dropping connection");
    shared.finish(conn, false).await;
}

async fn respond(conn: &mut Connection, bytes: &[u8], limit: Duration) -> io::Result<()> {
    let stream = conn.stream_mut();
    bounded(limit, async {
        stream.write_all(bytes).await?;
        stream.flush().await
    })
    .await
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "request already finished")
}

struct HttpState {
    conn: Option<Connection>,
    response: ResponseHead,
    headers_sent: bool,
    closed: bool,
    /// A socket write failed; the connection cannot be reused.
    broken: bool,
    /// Final keep-alive decision, made when the head goes out.
    keep_alive: bool,
    /// Request body bytes not yet read by the backend.
    body_remaining: u64,
    output_buffering: bool,
    pending: Vec<u8>,
    /// Status reported to metrics.
    status: u16,
}

/// One HTTP request shared between the worker and the backend.
pub struct HttpExchange {
    state: Mutex<HttpState>,
    head: RequestHead,
    peer: PeerAddr,
    local: PeerAddr,
    policy: ConnectionPolicy,
    io_timeout: Duration,
    /// HEAD requests get the head but no body.
    head_only: bool,
}

impl HttpExchange {
    pub fn new(conn: Connection, head: RequestHead, policy: ConnectionPolicy, io_timeout: Duration) -> Self {
        let body_remaining = if head.verb.eq_ignore_ascii_case("GET") || head.verb.eq_ignore_ascii_case("HEAD") {
            0
        } else {
            head.content_length().unwrap_or(0)
        };
        let peer = conn.peer().clone();
        let local = conn.local().clone();
        Self {
            state: Mutex::new(HttpState {
                conn: Some(conn),
                response: ResponseHead::new(&head.protocol),
                headers_sent: false,
                closed: false,
                broken: false,
                keep_alive: false,
                body_remaining,
                output_buffering: false,
                pending: Vec::new(),
                status: 200,
            }),
            head_only: head.verb.eq_ignore_ascii_case("HEAD"),
            head,
            peer,
            local,
            policy,
            io_timeout,
        }
    }

    /// Request metadata as handed to the backend.
    pub fn begin_request(&self, id: RequestId, physical_path: &str) -> BeginRequest {
        BeginRequest {
            id,
            verb: self.head.verb.clone(),
            path: self.head.path.clone(),
            query_string: self.head.query_string.clone(),
            protocol: self.head.protocol.clone(),
            local_address: self.local.ip_string(),
            server_port: self.local.port(),
            remote_address: self.peer.ip_string(),
            remote_port: self.peer.port(),
            remote_name: self.peer.ip_string(),
            headers: self.head.headers.clone(),
            virtual_server: self.head.host().unwrap_or_default(),
            physical_path: Some(physical_path.to_string()),
        }
    }

    /// Complete the response and give the connection back.
    ///
    /// Returns the connection (if still owned), the status to report and
    /// whether the socket may carry another request.
    pub async fn finish(&self, failed: bool) -> (Option<Connection>, u16, bool) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if failed && !state.headers_sent {
            state.headers_sent = true;
            state.closed = true;
            state.keep_alive = false;
            state.status = 500;
            if let Some(conn) = state.conn.as_mut() {
                let _ = respond(conn, response::server_error_page(), self.io_timeout).await;
            }
        } else if !state.closed {
            if let Err(e) = self.close_locked(state).await {
                tracing::debug!(error = %e, "Closing response failed");
            }
        }

        if state.keep_alive && state.body_remaining > 0 {
            state.keep_alive = state.body_remaining <= MAX_DRAIN && self.drain_body(state).await;
        }
        let keep_alive = state.keep_alive && !failed && !state.broken;
        (state.conn.take(), state.status, keep_alive)
    }

    async fn send_head(&self, state: &mut HttpState) -> io::Result<()> {
        if state.headers_sent {
            return Ok(());
        }
        state.headers_sent = true;
        state.keep_alive = self.policy.keep_alive
            && self.policy.remaining > 0
            && state.response.allows_keep_alive(true);
        state.status = state.response.status();
        let bytes = state.response.encode(ConnectionPolicy {
            keep_alive: state.keep_alive,
            ..self.policy
        });
        self.write_raw(state, &bytes).await
    }

    async fn write_raw(&self, state: &mut HttpState, data: &[u8]) -> io::Result<()> {
        let conn = state.conn.as_mut().ok_or_else(gone)?;
        let stream = conn.stream_mut();
        let result = bounded(self.io_timeout, stream.write_all(data)).await;
        if result.is_err() {
            state.broken = true;
        }
        result
    }

    async fn flush_locked(&self, state: &mut HttpState) -> io::Result<()> {
        self.send_head(state).await?;
        if !state.pending.is_empty() {
            let pending = std::mem::take(&mut state.pending);
            self.write_raw(state, &pending).await?;
        }
        let conn = state.conn.as_mut().ok_or_else(gone)?;
        let stream = conn.stream_mut();
        bounded(self.io_timeout, stream.flush()).await
    }

    async fn write_locked(&self, state: &mut HttpState, data: &[u8]) -> io::Result<()> {
        if state.closed {
            return Ok(());
        }
        self.send_head(state).await?;
        if self.head_only || data.is_empty() {
            return Ok(());
        }
        if state.output_buffering {
            state.pending.extend_from_slice(data);
            return Ok(());
        }
        if !state.pending.is_empty() {
            let pending = std::mem::take(&mut state.pending);
            self.write_raw(state, &pending).await?;
        }
        self.write_raw(state, data).await
    }

    async fn close_locked(&self, state: &mut HttpState) -> io::Result<()> {
        if state.closed {
            return Ok(());
        }
        let result = self.flush_locked(state).await;
        state.closed = true;
        result
    }

    /// Answer on the backend's behalf with a not-found page.
    async fn refuse_locked(&self, state: &mut HttpState) {
        if state.headers_sent {
            let _ = self.close_locked(state).await;
            return;
        }
        state.headers_sent = true;
        state.closed = true;
        state.keep_alive = false;
        state.status = 404;
        let page = response::not_found_page(&self.head.uri());
        let _ = self.write_raw(state, &page).await;
    }

    /// Discard the unread request body. Returns whether it was consumed.
    async fn drain_body(&self, state: &mut HttpState) -> bool {
        while state.body_remaining > 0 {
            match self.read_locked(state, FILE_CHUNK).await {
                Ok(chunk) if !chunk.is_empty() => {}
                _ => return false,
            }
        }
        true
    }

    async fn read_locked(&self, state: &mut HttpState, size: usize) -> io::Result<Bytes> {
        if state.body_remaining == 0 || size == 0 {
            return Ok(Bytes::new());
        }
        let want = state.body_remaining.min(size as u64) as usize;
        let conn = state.conn.as_mut().ok_or_else(gone)?;

        if !conn.has_buffered_input() {
            let (stream, buffer) = conn.io_mut();
            buffer.reserve(want);
            let read = bounded(self.io_timeout, stream.read_buf(buffer)).await?;
            if read == 0 {
                // Client stopped sending; the body is short.
                state.body_remaining = 0;
                state.broken = true;
                return Ok(Bytes::new());
            }
        }

        let buffer = conn.buffer_mut();
        let take = want.min(buffer.len());
        let chunk = buffer.split_to(take).freeze();
        state.body_remaining -= take as u64;
        Ok(chunk)
    }

    fn http_variable(&self, name: &str) -> Option<String> {
        let header = name.strip_prefix("HTTP_")?.replace('_', "-");
        self.head.header(&header).map(str::to_string)
    }
}

#[async_trait]
impl RequestIo for HttpExchange {
    async fn read(&self, size: usize) -> io::Result<Bytes> {
        let mut guard = self.state.lock().await;
        self.read_locked(&mut guard, size).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.state.lock().await;
        self.write_locked(&mut guard, data).await
    }

    async fn flush(&self) -> io::Result<()> {
        let mut guard = self.state.lock().await;
        if guard.closed {
            return Ok(());
        }
        self.flush_locked(&mut guard).await
    }

    async fn close(&self) {
        let mut guard = self.state.lock().await;
        if let Err(e) = self.close_locked(&mut guard).await {
            tracing::debug!(error = %e, "Closing response failed");
        }
    }

    async fn is_connected(&self) -> bool {
        let guard = self.state.lock().await;
        guard.conn.is_some() && !guard.broken
    }

    fn control(&self) -> Option<&dyn ResponseControl> {
        Some(self)
    }
}

#[async_trait]
impl ResponseControl for HttpExchange {
    async fn set_status(&self, code: u16, reason: &str) {
        let mut guard = self.state.lock().await;
        if guard.headers_sent {
            tracing::debug!(code, "Status set after headers were sent; ignored");
            return;
        }
        guard.response.set_status(code, reason);
    }

    async fn set_response_header(&self, name: &str, value: &str) {
        let mut guard = self.state.lock().await;
        if guard.headers_sent {
            tracing::debug!(header = %name, "Response header set after headers were sent; ignored");
            return;
        }
        guard.response.add_header(name, value);
    }

    async fn server_variable(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_uppercase();
        let value = match name.as_str() {
            "GATEWAY_INTERFACE" => "CGI/1.1".to_string(),
            "HTTPS" => "off".to_string(),
            "SERVER_SOFTWARE" => SERVER_SOFTWARE.to_string(),
            "SERVER_PROTOCOL" => self.head.protocol.clone(),
            "REQUEST_METHOD" => self.head.verb.clone(),
            "REQUEST_URI" => self.head.uri(),
            "QUERY_STRING" => self.head.query_string.clone(),
            "REMOTE_ADDR" | "REMOTE_HOST" => self.peer.ip_string(),
            "REMOTE_PORT" => self.peer.port().to_string(),
            "SERVER_ADDR" | "LOCAL_ADDR" => self.local.ip_string(),
            "SERVER_PORT" => self.local.port().to_string(),
            "SERVER_NAME" => self.head.host().unwrap_or_else(|| self.local.ip_string()),
            _ => return self.http_variable(&name),
        };
        Some(value)
    }

    async fn send_file(&self, path: &str) -> io::Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut guard = self.state.lock().await;
        let mut chunk = vec![0u8; FILE_CHUNK];
        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                return Ok(());
            }
            self.write_locked(&mut guard, &chunk[..read]).await?;
        }
    }

    fn local_port(&self) -> u16 {
        self.local.port()
    }

    async fn headers_sent(&self) -> bool {
        self.state.lock().await.headers_sent
    }

    async fn decline(&self) {
        let mut guard = self.state.lock().await;
        self.refuse_locked(&mut guard).await;
    }

    async fn not_found(&self) {
        let mut guard = self.state.lock().await;
        self.refuse_locked(&mut guard).await;
    }

    async fn set_output_buffering(&self, enabled: bool) {
        self.state.lock().await.output_buffering = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::read_request_head;
    use crate::net::Stream;
    use tokio::net::{TcpListener, TcpStream};

    async fn exchange(raw: &[u8], policy: ConnectionPolicy) -> (HttpExchange, TcpStream) {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(tcp.local_addr().unwrap()).await.unwrap();
        let (server, peer) = tcp.accept().await.unwrap();
        client.write_all(raw).await.unwrap();

        let mut conn = Connection::new(Stream::from(server), PeerAddr::Tcp(peer), None);
        let (stream, buffer) = conn.io_mut();
        let head = read_request_head(stream, buffer, Duration::from_secs(1)).await.unwrap();
        (HttpExchange::new(conn, head, policy, Duration::from_secs(1)), client)
    }

    fn keep_alive(remaining: u32) -> ConnectionPolicy {
        ConnectionPolicy {
            keep_alive: true,
            remaining,
            timeout_secs: 15,
        }
    }

    async fn read_all(client: &mut TcpStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn body_reads_serve_preloaded_bytes_then_socket() {
        let (exchange, mut client) =
            exchange(b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello", keep_alive(5)).await;

        assert_eq!(&exchange.read(3).await.unwrap()[..], b"hel");
        assert_eq!(&exchange.read(100).await.unwrap()[..], b"lo");
        client.write_all(b"worldEXTRA").await.unwrap();
        assert_eq!(&exchange.read(100).await.unwrap()[..], b"world");
        assert!(exchange.read(100).await.unwrap().is_empty());

        let (conn, _, _) = exchange.finish(false).await;
        // Bytes past the body stay for the next request.
        let mut conn = conn.unwrap();
        assert!(conn.buffer_mut().starts_with(b"EXTRA"));
    }

    #[tokio::test]
    async fn get_requests_have_no_body() {
        let (exchange, _client) =
            exchange(b"GET / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd", keep_alive(5)).await;
        assert!(exchange.read(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn head_is_sent_once_before_the_body() {
        let (exchange, mut client) = exchange(b"GET / HTTP/1.1\r\n\r\n", keep_alive(3)).await;
        exchange.set_status(201, "").await;
        exchange.set_response_header("Content-Length", "4").await;
        exchange.write(b"ab").await.unwrap();
        exchange.set_response_header("X-Late", "ignored").await;
        exchange.write(b"cd").await.unwrap();
        assert!(exchange.headers_sent().await);

        let (conn, status, keep_alive) = exchange.finish(false).await;
        assert_eq!(status, 201);
        assert!(keep_alive);
        drop(conn);

        let text = read_all(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("Keep-Alive: timeout=15, max=3\r\n"));
        assert!(!text.contains("X-Late"));
        assert!(text.ends_with("\r\n\r\nabcd"));
    }

    #[tokio::test]
    async fn missing_content_length_closes() {
        let (exchange, mut client) = exchange(b"GET / HTTP/1.1\r\n\r\n", keep_alive(3)).await;
        exchange.write(b"body").await.unwrap();
        let (conn, _, keep_alive) = exchange.finish(false).await;
        assert!(!keep_alive);
        drop(conn);
        assert!(read_all(&mut client).await.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn failure_before_head_sends_server_error() {
        let (exchange, mut client) = exchange(b"GET / HTTP/1.1\r\n\r\n", keep_alive(3)).await;
        let (conn, status, keep_alive) = exchange.finish(true).await;
        assert_eq!(status, 500);
        assert!(!keep_alive);
        drop(conn);
        assert!(read_all(&mut client)
            .await
            .starts_with("HTTP/1.0 500 Server error\r\n"));
    }

    #[tokio::test]
    async fn output_buffering_holds_body_until_flush() {
        let (exchange, mut client) = exchange(b"GET / HTTP/1.0\r\n\r\n", keep_alive(0)).await;
        exchange.set_output_buffering(true).await;
        exchange.write(b"buffered").await.unwrap();
        exchange.close().await;
        exchange.write(b"dropped").await.unwrap();
        let (conn, _, _) = exchange.finish(false).await;
        drop(conn);

        let text = read_all(&mut client).await;
        assert!(text.ends_with("buffered"));
    }

    #[tokio::test]
    async fn server_variables_describe_the_request() {
        let (exchange, _client) = exchange(
            b"GET /p?q=1 HTTP/1.1\r\nHost: site.test:8080\r\nUser-Agent: probe\r\n\r\n",
            keep_alive(1),
        )
        .await;
        assert_eq!(exchange.server_variable("REQUEST_METHOD").await.as_deref(), Some("GET"));
        assert_eq!(exchange.server_variable("query_string").await.as_deref(), Some("q=1"));
        assert_eq!(exchange.server_variable("SERVER_NAME").await.as_deref(), Some("site.test"));
        assert_eq!(exchange.server_variable("HTTP_USER_AGENT").await.as_deref(), Some("probe"));
        assert_eq!(exchange.server_variable("HTTPS").await.as_deref(), Some("off"));
        assert_eq!(exchange.server_variable("NO_SUCH").await, None);
    }

    #[tokio::test]
    async fn unread_small_body_is_drained_for_reuse() {
        let (exchange, _client) = exchange(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
            keep_alive(2),
        )
        .await;
        exchange.set_response_header("Content-Length", "0").await;
        let (conn, _, keep_alive) = exchange.finish(false).await;
        assert!(keep_alive);
        assert!(!conn.unwrap().has_buffered_input());
    }

    #[tokio::test]
    async fn begin_request_carries_metadata() {
        let (exchange, _client) = exchange(
            b"GET /app/page?x=1 HTTP/1.1\r\nHost: Site.Test\r\nAccept: */*\r\n\r\n",
            keep_alive(1),
        )
        .await;
        let request = exchange.begin_request(RequestId::from_raw(0x10001), "/srv/app");
        assert_eq!(request.verb, "GET");
        assert_eq!(request.path, "/app/page");
        assert_eq!(request.query_string, "x=1");
        assert_eq!(request.virtual_server, "site.test");
        assert_eq!(request.remote_address, "127.0.0.1");
        assert_eq!(request.header("accept"), Some("*/*"));
        assert_eq!(request.physical_path.as_deref(), Some("/srv/app"));
    }
}
