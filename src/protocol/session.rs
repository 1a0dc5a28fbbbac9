//! Stateful endpoints of a protocol channel.
//!
//! # Responsibilities
//! - `RequesterChannel`: announce a request, then execute commands until the
//!   handler ends the exchange
//! - `HandlerChannel` / `HandlerSession`: accept a request, then drive the
//!   requester with commands
//! - Buffer response headers on the handler side and flush them exactly once
//!
//! # Design Decisions
//! - A channel may carry many exchanges back to back; a clean EOF between
//!   exchanges ends it
//! - Every command that has a reply blocks until that reply is decoded

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts};

use super::codec::{HandlerCodec, HandlerFrame, RequesterCodec};
use super::error::ProtocolError;
use super::message::{Command, Handshake, InitialRequest, Reply};

/// Requester end: sends initial requests and answers commands.
pub struct RequesterChannel<S> {
    framed: Framed<S, RequesterCodec>,
}

impl<S> RequesterChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, RequesterCodec::new()),
        }
    }

    /// Start an exchange.
    pub async fn begin(&mut self, request: InitialRequest) -> Result<(), ProtocolError> {
        self.framed.send(Handshake::Request(request)).await
    }

    /// Wait for the handler's next command.
    pub async fn next_command(&mut self) -> Result<Command, ProtocolError> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn reply(&mut self, reply: Reply) -> Result<(), ProtocolError> {
        self.framed.send(reply).await
    }

    /// Tell the handler this side is going away.
    pub async fn announce_shutdown(mut self) -> Result<(), ProtocolError> {
        self.framed.send(Handshake::Shutdown).await
    }
}

/// What a handler channel received at an exchange boundary.
pub enum Inbound<S> {
    Request(HandlerSession<S>),
    /// The requester announced its shutdown.
    Shutdown,
    /// The stream ended cleanly between exchanges.
    Closed,
}

/// Handler end between exchanges.
pub struct HandlerChannel<S> {
    framed: Framed<S, HandlerCodec>,
}

impl<S> HandlerChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, HandlerCodec::new()),
        }
    }

    /// Resume a channel whose stream already has bytes read ahead.
    pub fn with_read_buffer(stream: S, read_buf: BytesMut) -> Self {
        let mut parts = FramedParts::new::<Command>(stream, HandlerCodec::new());
        parts.read_buf = read_buf;
        Self {
            framed: Framed::from_parts(parts),
        }
    }

    /// Wait for the next exchange.
    pub async fn accept(mut self) -> Result<Inbound<S>, ProtocolError> {
        match self.framed.next().await {
            None => Ok(Inbound::Closed),
            Some(Err(err)) => Err(err),
            Some(Ok(HandlerFrame::Handshake(Handshake::Shutdown))) => Ok(Inbound::Shutdown),
            Some(Ok(HandlerFrame::Handshake(Handshake::Request(request)))) => {
                Ok(Inbound::Request(HandlerSession::new(self.framed, request)))
            }
            Some(Ok(HandlerFrame::Reply(_))) => Err(ProtocolError::Unexpected("reply outside a command")),
        }
    }

    /// Give back the stream and any bytes read ahead of the decoder.
    pub fn into_parts(self) -> (S, BytesMut) {
        let parts = self.framed.into_parts();
        (parts.io, parts.read_buf)
    }
}

/// Handler end of a single exchange.
pub struct HandlerSession<S> {
    framed: Framed<S, HandlerCodec>,
    request: InitialRequest,
    pending_headers: Vec<(String, String)>,
    headers_sent: bool,
    output_buffering: bool,
    configuration_dirty: bool,
    client_block_setup: Option<bool>,
}

impl<S> HandlerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(framed: Framed<S, HandlerCodec>, request: InitialRequest) -> Self {
        Self {
            framed,
            request,
            pending_headers: Vec::new(),
            headers_sent: false,
            output_buffering: false,
            configuration_dirty: false,
            client_block_setup: None,
        }
    }

    pub fn request(&self) -> &InitialRequest {
        &self.request
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    async fn send(&mut self, command: Command) -> Result<(), ProtocolError> {
        self.framed.send(command).await
    }

    async fn call(&mut self, command: Command) -> Result<Reply, ProtocolError> {
        let Some(kind) = command.reply_kind() else {
            self.send(command).await?;
            return Err(ProtocolError::Unexpected("command has no reply"));
        };
        self.framed.codec_mut().expect_reply(kind);
        self.send(command).await?;
        match self.framed.next().await {
            Some(Ok(HandlerFrame::Reply(reply))) if reply.kind() == kind => Ok(reply),
            Some(Ok(_)) => Err(ProtocolError::Unexpected("reply of the wrong shape")),
            Some(Err(err)) => Err(err),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn call_int(&mut self, command: Command) -> Result<i32, ProtocolError> {
        match self.call(command).await? {
            Reply::Int(value) => Ok(value),
            _ => Err(ProtocolError::Unexpected("expected integer reply")),
        }
    }

    /// Queue a response header. Ignored once headers have gone out.
    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers_sent {
            tracing::debug!("Response header set after headers were sent; ignored");
            return;
        }
        self.pending_headers.push((name.into(), value.into()));
    }

    /// Change output buffering; sent lazily before the next body command.
    pub fn set_output_buffering(&mut self, enabled: bool) {
        if self.output_buffering != enabled {
            self.output_buffering = enabled;
            self.configuration_dirty = true;
        }
    }

    async fn send_configuration(&mut self) -> Result<(), ProtocolError> {
        if self.configuration_dirty {
            self.configuration_dirty = false;
            let output_buffering = self.output_buffering;
            self.send(Command::SetConfiguration { output_buffering }).await?;
        }
        Ok(())
    }

    async fn flush_headers(&mut self) -> Result<(), ProtocolError> {
        if self.headers_sent {
            return Ok(());
        }
        self.headers_sent = true;
        let headers = std::mem::take(&mut self.pending_headers);
        self.send(Command::SetResponseHeaders(headers)).await
    }

    pub async fn set_status(&mut self, code: i32, status_line: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(Command::SetStatus {
            code,
            status_line: status_line.into(),
        })
        .await
    }

    pub async fn send_bytes(&mut self, data: Bytes) -> Result<(), ProtocolError> {
        self.send_configuration().await?;
        self.flush_headers().await?;
        self.send(Command::SendBytes(data)).await
    }

    pub async fn send_file(&mut self, file_name: impl Into<String>) -> Result<(), ProtocolError> {
        self.send_configuration().await?;
        self.flush_headers().await?;
        self.send(Command::SendFile(file_name.into())).await
    }

    pub async fn server_variable(&mut self, name: impl Into<String>) -> Result<Option<String>, ProtocolError> {
        match self.call(Command::GetServerVariable(name.into())).await? {
            Reply::Variable(value) => Ok(value),
            _ => Err(ProtocolError::Unexpected("expected variable reply")),
        }
    }

    pub async fn local_port(&mut self) -> Result<i32, ProtocolError> {
        self.call_int(Command::GetLocalPort).await
    }

    pub async fn is_connected(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.call_int(Command::IsConnected).await? != 0)
    }

    pub async fn should_client_block(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.call_int(Command::ShouldClientBlock).await? == 0)
    }

    pub async fn setup_client_block(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.call_int(Command::SetupClientBlock).await? == 0)
    }

    /// Raw block read; `None` when the requester reported a read error.
    pub async fn client_block(&mut self, size: usize) -> Result<Option<Bytes>, ProtocolError> {
        let size = i32::try_from(size).unwrap_or(i32::MAX);
        match self.call(Command::GetClientBlock(size)).await? {
            Reply::Block(Some(data)) if data.len() > size as usize => {
                Err(ProtocolError::Unexpected("client block larger than requested"))
            }
            Reply::Block(data) => Ok(data),
            _ => Err(ProtocolError::Unexpected("expected block reply")),
        }
    }

    /// Read up to `size` bytes of request body; empty once the body is
    /// exhausted or unavailable.
    pub async fn read_body(&mut self, size: usize) -> Result<Bytes, ProtocolError> {
        let ready = match self.client_block_setup {
            Some(ready) => ready,
            None => {
                let ready = self.setup_client_block().await? && self.should_client_block().await?;
                self.client_block_setup = Some(ready);
                ready
            }
        };
        if !ready || size == 0 {
            return Ok(Bytes::new());
        }
        Ok(self.client_block(size).await?.unwrap_or_default())
    }

    /// Hand the request back to the requester unanswered.
    pub async fn decline(mut self) -> Result<HandlerChannel<S>, ProtocolError> {
        self.send(Command::Decline).await?;
        Ok(HandlerChannel { framed: self.framed })
    }

    pub async fn not_found(mut self) -> Result<HandlerChannel<S>, ProtocolError> {
        self.send(Command::NotFound).await?;
        Ok(HandlerChannel { framed: self.framed })
    }

    /// Finish the exchange, flushing headers first if nothing was written.
    pub async fn close(mut self) -> Result<HandlerChannel<S>, ProtocolError> {
        self.send_configuration().await?;
        self.flush_headers().await?;
        self.send(Command::Close).await?;
        Ok(HandlerChannel { framed: self.framed })
    }
}
