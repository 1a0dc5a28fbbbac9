//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use hostbridge::backend::{BackendContext, BackendError, BeginRequest, ContextFactory};
use hostbridge::broker::RequestBroker;
use hostbridge::config::GatewayConfig;
use hostbridge::lifecycle::Shutdown;
use hostbridge::net::{Listener, Stream};
use hostbridge::protocol::{HandlerChannel, HandlerSession, Inbound};
use hostbridge::routing::RouteSpec;
use hostbridge::Gateway;

/// In-process application: echoes what it was asked for.
///
/// `/missing...` answers not-found, `/decline...` declines, `/echo...`
/// returns the request body, anything else describes the request.
#[derive(Debug)]
pub struct EchoContext {
    broker: Arc<RequestBroker>,
    target: String,
}

#[async_trait]
impl BackendContext for EchoContext {
    async fn begin_request(&self, request: BeginRequest) -> Result<(), BackendError> {
        let id = request.id;
        let broker = &self.broker;
        let relative = request.path.trim_start_matches('/');
        let leaf = relative.rsplit('/').next().unwrap_or_default();

        if leaf.starts_with("missing") {
            broker.not_found(id).await;
            return Ok(());
        }
        if leaf.starts_with("decline") {
            broker.decline(id).await;
            return Ok(());
        }

        let body = if leaf.starts_with("echo") {
            let mut body = Vec::new();
            loop {
                let chunk = match broker.read(id, 4096).await {
                    Ok(chunk) if !chunk.is_empty() => chunk,
                    _ => break,
                };
                body.extend_from_slice(&chunk);
            }
            body
        } else {
            let port = broker.local_port(id).unwrap_or(0);
            let agent = broker
                .server_variable(id, "HTTP_USER_AGENT")
                .await
                .unwrap_or_default();
            format!(
                "{} {} target={} port={} agent={}",
                request.verb, request.path, self.target, port, agent
            )
            .into_bytes()
        };

        broker.set_status(id, 200, "OK").await;
        broker.set_response_header(id, "Content-Type", "text/plain").await;
        broker
            .set_response_header(id, "Content-Length", &body.len().to_string())
            .await;
        if broker.write(id, &body).await.is_ok() {
            broker.close(id).await;
        }
        Ok(())
    }
}

/// Creates [`EchoContext`]s and counts how many it made.
pub struct EchoFactory {
    broker: Arc<RequestBroker>,
    created: AtomicUsize,
    /// Artificial delay inside `create`, to widen creation races.
    delay: Duration,
}

impl EchoFactory {
    pub fn new(broker: Arc<RequestBroker>) -> Self {
        Self::with_delay(broker, Duration::ZERO)
    }

    pub fn with_delay(broker: Arc<RequestBroker>, delay: Duration) -> Self {
        Self {
            broker,
            created: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextFactory for EchoFactory {
    async fn create(&self, route: &RouteSpec) -> Result<Arc<dyn BackendContext>, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EchoContext {
            broker: Arc::clone(&self.broker),
            target: route.target.clone(),
        }))
    }
}

/// A gateway running on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<()>,
}

impl TestGateway {
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Config with short timeouts suited to tests.
pub fn test_config(applications: &str) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.applications = applications.into();
    config.timeouts.idle_secs = 5;
    config.timeouts.io_secs = 5;
    config.timeouts.linger_secs = 1;
    config.timeouts.max_linger_secs = 2;
    config.timeouts.shutdown_grace_secs = 2;
    config
}

/// Start `gateway` on an ephemeral TCP port.
pub async fn spawn_gateway(gateway: Gateway) -> TestGateway {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let shutdown = gateway.shutdown_handle();
    let handle = tokio::spawn(gateway.run(Listener::from_tcp(tcp, 64)));
    TestGateway {
        addr,
        shutdown,
        handle,
    }
}

/// Start a gateway whose routes are served in-process by [`EchoFactory`].
pub async fn start_echo_gateway(config: GatewayConfig) -> (TestGateway, Arc<EchoFactory>) {
    start_echo_gateway_with_delay(config, Duration::ZERO).await
}

pub async fn start_echo_gateway_with_delay(
    config: GatewayConfig,
    delay: Duration,
) -> (TestGateway, Arc<EchoFactory>) {
    let broker = Arc::new(RequestBroker::new());
    let factory = Arc::new(EchoFactory::with_delay(Arc::clone(&broker), delay));
    let gateway = Gateway::new(config, broker, factory.clone()).unwrap();
    (spawn_gateway(gateway).await, factory)
}

/// Send raw bytes and read until the server closes.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// One response read off a kept-alive connection.
pub struct Response {
    pub head: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read one `Content-Length` framed response.
pub async fn read_response(stream: &mut TcpStream) -> Response {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed mid-head");
        raw.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&raw).into_owned();
    let mut response = Response {
        head,
        body: Vec::new(),
    };
    let length: usize = response
        .header("Content-Length")
        .and_then(|len| len.parse().ok())
        .unwrap_or(0);
    response.body = vec![0u8; length];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut response.body))
        .await
        .unwrap()
        .unwrap();
    response
}

/// Whether the server has closed `stream`.
pub async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

/// Start a backend process on an ephemeral port. `handle` serves each
/// request session and returns the channel for the next one. The counter
/// tracks accepted connections.
pub async fn start_wire_backend<F, Fut>(handle: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(HandlerSession<Stream>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Option<HandlerChannel<Stream>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = Arc::new(handle);
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let mut channel = HandlerChannel::new(Stream::from(socket));
                loop {
                    match channel.accept().await {
                        Ok(Inbound::Request(session)) => match handle(session).await {
                            Some(next) => channel = next,
                            None => break,
                        },
                        _ => break,
                    }
                }
            });
        }
    });
    (addr, accepted)
}

/// Backend handler that answers every request with its URI.
pub async fn answer_with_uri(mut session: HandlerSession<Stream>) -> Option<HandlerChannel<Stream>> {
    let body = format!("backend saw {}", session.request().uri);
    session.set_status(200, "200 OK").await.ok()?;
    session.set_response_header("Content-Type", "text/plain");
    session.set_response_header("Content-Length", body.len().to_string());
    session.send_bytes(Bytes::from(body)).await.ok()?;
    session.close().await.ok()
}
