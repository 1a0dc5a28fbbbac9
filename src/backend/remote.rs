//! Backend contexts living in separate processes.
//!
//! A [`RemoteContext`] forwards each request to a backend process over the
//! wire protocol: it sends the initial block, then executes the backend's
//! commands against the worker through the broker until the backend ends the
//! exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::channel::{ChannelPool, ChannelSettings, PooledChannel};
use super::{BackendContext, BackendError, BeginRequest, ContextFactory, Endpoint};
use crate::broker::{RequestBroker, RequestId};
use crate::observability::metrics;
use crate::protocol::wire::MAX_BODY_CHUNK;
use crate::protocol::{Command, InitialRequest, ProtocolError, Reply};
use crate::routing::RouteSpec;

/// What follows a command.
enum Flow {
    Continue,
    Done,
}

/// Context for one route entry, served by a backend process.
#[derive(Debug)]
pub struct RemoteContext {
    route: RouteSpec,
    pool: Arc<ChannelPool>,
    broker: Arc<RequestBroker>,
    unloaded: AtomicBool,
}

impl RemoteContext {
    pub fn new(route: RouteSpec, pool: Arc<ChannelPool>, broker: Arc<RequestBroker>) -> Self {
        Self {
            route,
            pool,
            broker,
            unloaded: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Check out a channel, announce the request and wait for the backend's
    /// first command. A pooled channel the backend closed while idle still
    /// takes the write and only fails on the read; it is replaced by a fresh
    /// one once. Nothing has been consumed from the client at that point.
    async fn open(&self, initial: &InitialRequest) -> Result<(PooledChannel, Command), BackendError> {
        let mut channel = self.pool.checkout().await?;
        match first_command(&mut channel, initial).await {
            Ok(command) => return Ok((channel, command)),
            Err(err) if channel.was_reused() && !err.is_violation() => {
                tracing::debug!(endpoint = %self.pool.endpoint(), error = %err, "Stale backend channel replaced");
            }
            Err(err) => {
                metrics::record_protocol_error(err.kind());
                return Err(err.into());
            }
        }
        drop(channel);
        let mut channel = self.pool.checkout_fresh().await?;
        match first_command(&mut channel, initial).await {
            Ok(command) => Ok((channel, command)),
            Err(err) => {
                metrics::record_protocol_error(err.kind());
                Err(err.into())
            }
        }
    }

    async fn execute(
        &self,
        id: RequestId,
        command: Command,
        has_body: bool,
        channel: &mut PooledChannel,
    ) -> Result<Flow, ProtocolError> {
        let broker = &self.broker;
        match command {
            Command::SendBytes(data) => {
                if let Err(e) = broker.write(id, &data).await {
                    tracing::debug!(request_id = %id, error = %e, "Client write failed");
                }
            }
            Command::GetServerVariable(name) => {
                let value = broker.server_variable(id, &name).await;
                channel.reply(Reply::Variable(value)).await?;
            }
            Command::SetResponseHeaders(headers) => {
                for (name, value) in &headers {
                    broker.set_response_header(id, name, value).await;
                }
            }
            Command::GetLocalPort => {
                let port = broker.local_port(id).unwrap_or(0);
                channel.reply(Reply::Int(i32::from(port))).await?;
            }
            Command::Close => {
                broker.close(id).await;
                return Ok(Flow::Done);
            }
            Command::ShouldClientBlock => {
                channel.reply(Reply::Int(if has_body { 0 } else { 1 })).await?;
            }
            Command::SetupClientBlock => {
                channel.reply(Reply::Int(0)).await?;
            }
            Command::GetClientBlock(size) => {
                let size = usize::try_from(size).unwrap_or(0).min(MAX_BODY_CHUNK);
                let block = match broker.read(id, size).await {
                    Ok(data) => Some(data),
                    Err(e) => {
                        tracing::debug!(request_id = %id, error = %e, "Client read failed");
                        None
                    }
                };
                channel.reply(Reply::Block(block)).await?;
            }
            Command::SetStatus { code, status_line } => {
                let code = u16::try_from(code).unwrap_or(500);
                broker.set_status(id, code, reason_of(&status_line)).await;
            }
            Command::Decline => {
                broker.decline(id).await;
                return Ok(Flow::Done);
            }
            Command::NotFound => {
                broker.not_found(id).await;
                return Ok(Flow::Done);
            }
            Command::IsConnected => {
                let connected = broker.is_connected(id).await;
                channel.reply(Reply::Int(i32::from(connected))).await?;
            }
            Command::SendFile(path) => {
                if let Err(e) = broker.send_file(id, &path).await {
                    tracing::debug!(request_id = %id, path = %path, error = %e, "Sending file failed");
                }
            }
            Command::SetConfiguration { output_buffering } => {
                broker.set_output_buffering(id, output_buffering).await;
            }
        }
        Ok(Flow::Continue)
    }
}

async fn first_command(
    channel: &mut PooledChannel,
    initial: &InitialRequest,
) -> Result<Command, ProtocolError> {
    channel.begin(initial.clone()).await?;
    channel.next_command().await
}

/// Reason phrase of a status line such as `404 Not Found`.
fn reason_of(status_line: &str) -> &str {
    status_line
        .trim_start()
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim()
}

#[async_trait]
impl BackendContext for RemoteContext {
    async fn begin_request(&self, request: BeginRequest) -> Result<(), BackendError> {
        if self.unloaded.load(Ordering::Acquire) {
            return Err(BackendError::Unloaded);
        }
        let id = request.id;
        let has_body = request
            .header("Content-Length")
            .and_then(|len| len.trim().parse::<u64>().ok())
            .is_some_and(|len| len > 0);
        let initial = request.to_initial();

        let (mut channel, mut command) = self.open(&initial).await?;
        loop {
            tracing::trace!(request_id = %id, code = command.code(), "Backend command");
            match self.execute(id, command, has_body, &mut channel).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => break,
                Err(err) => {
                    metrics::record_protocol_error(err.kind());
                    return Err(err.into());
                }
            }
            command = match channel.next_command().await {
                Ok(command) => command,
                Err(err) => {
                    metrics::record_protocol_error(err.kind());
                    return Err(err.into());
                }
            };
        }
        channel.release();
        Ok(())
    }

    async fn unload(&self) {
        self.unloaded.store(true, Ordering::Release);
        tracing::info!(prefix = %self.route.prefix, endpoint = %self.pool.endpoint(), "Unloading remote context");
        self.pool.shutdown().await;
    }
}

/// Creates a [`RemoteContext`] per route entry.
pub struct RemoteContextFactory {
    broker: Arc<RequestBroker>,
    default_endpoint: Option<Endpoint>,
    settings: ChannelSettings,
}

impl RemoteContextFactory {
    pub fn new(
        broker: Arc<RequestBroker>,
        default_endpoint: Option<Endpoint>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            broker,
            default_endpoint,
            settings,
        }
    }
}

#[async_trait]
impl ContextFactory for RemoteContextFactory {
    async fn create(&self, route: &RouteSpec) -> Result<Arc<dyn BackendContext>, BackendError> {
        let endpoint = match route.endpoint.as_deref() {
            Some(endpoint) => Endpoint::parse(endpoint)?,
            None => self.default_endpoint.clone().ok_or_else(|| {
                BackendError::InvalidEndpoint(format!("no endpoint for route {}", route.prefix))
            })?,
        };
        let pool = Arc::new(ChannelPool::new(endpoint, self.settings));
        Ok(Arc::new(RemoteContext::new(
            route.clone(),
            pool,
            Arc::clone(&self.broker),
        )))
    }
}
