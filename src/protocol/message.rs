//! Frame types carried by the wire protocol.

use bytes::{Bytes, BytesMut};

use super::error::ProtocolError;
use super::wire::{self, FieldReader};

/// Request metadata sent once at the start of every exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialRequest {
    pub verb: String,
    pub virtual_server: String,
    pub uri: String,
    pub query_string: String,
    pub protocol: String,
    pub local_address: String,
    pub server_port: i32,
    pub remote_address: String,
    pub remote_port: i32,
    pub remote_name: String,
    /// Header pairs in the order the client sent them.
    pub headers: Vec<(String, String)>,
    /// Physical application path, when the requester knows it.
    pub physical_path: Option<String>,
}

impl InitialRequest {
    /// Case-insensitive header lookup; returns the first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn encode_block(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        wire::put_string(dst, "verb", &self.verb)?;
        wire::put_string(dst, "virtual server", &self.virtual_server)?;
        wire::put_string(dst, "uri", &self.uri)?;
        wire::put_string(dst, "query string", &self.query_string)?;
        wire::put_string(dst, "protocol", &self.protocol)?;
        wire::put_string(dst, "local address", &self.local_address)?;
        wire::put_i32(dst, self.server_port);
        wire::put_string(dst, "remote address", &self.remote_address)?;
        wire::put_i32(dst, self.remote_port);
        wire::put_string(dst, "remote name", &self.remote_name)?;
        // Application auto-creation flag; peers ignore it.
        wire::put_i32(dst, 0);
        wire::put_i32(dst, self.headers.len() as i32);
        for (name, value) in &self.headers {
            wire::put_string(dst, "header name", name)?;
            wire::put_string(dst, "header value", value)?;
        }
        match &self.physical_path {
            Some(path) => {
                dst.extend_from_slice(&[1]);
                wire::put_string(dst, "physical path", path)?;
            }
            None => dst.extend_from_slice(&[0]),
        }
        Ok(())
    }

    /// Decode a complete block. Bytes left over after the last field are
    /// ignored.
    pub(crate) fn decode_block(block: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = FieldReader::new(block);
        let verb = required_string(&mut r, "verb")?;
        let virtual_server = required_string(&mut r, "virtual server")?;
        let uri = required_string(&mut r, "uri")?;
        let query_string = required_string(&mut r, "query string")?;
        let protocol = required_string(&mut r, "protocol")?;
        let local_address = required_string(&mut r, "local address")?;
        let server_port = r.i32().ok_or(ProtocolError::Truncated("server port"))?;
        let remote_address = required_string(&mut r, "remote address")?;
        let remote_port = r.i32().ok_or(ProtocolError::Truncated("remote port"))?;
        let remote_name = required_string(&mut r, "remote name")?;
        r.i32().ok_or(ProtocolError::Truncated("auto application flag"))?;

        let count = r.i32().ok_or(ProtocolError::Truncated("header count"))?;
        // Each pair needs at least two length prefixes.
        let count = wire::check_length("header count", i64::from(count), block.len() / 8)?;
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            let name = required_string(&mut r, "header name")?;
            let value = required_string(&mut r, "header value")?;
            headers.push((name, value));
        }

        let physical_path = match r.u8() {
            None | Some(0) => None,
            Some(_) => Some(required_string(&mut r, "physical path")?),
        };

        if r.remaining() > 0 {
            tracing::debug!(trailing = r.remaining(), "Ignoring trailing bytes in initial block");
        }

        Ok(Self {
            verb,
            virtual_server,
            uri,
            query_string,
            protocol,
            local_address,
            server_port,
            remote_address,
            remote_port,
            remote_name,
            headers,
            physical_path,
        })
    }
}

fn required_string(r: &mut FieldReader<'_>, field: &'static str) -> Result<String, ProtocolError> {
    r.string(field)?.ok_or(ProtocolError::Truncated(field))
}

/// First frame of an exchange as seen by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// A request block follows the version byte.
    Request(InitialRequest),
    /// The requester is shutting down.
    Shutdown,
}

/// Operations the handler asks the requester to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendBytes(Bytes),
    GetServerVariable(String),
    SetResponseHeaders(Vec<(String, String)>),
    GetLocalPort,
    Close,
    ShouldClientBlock,
    SetupClientBlock,
    GetClientBlock(i32),
    SetStatus { code: i32, status_line: String },
    Decline,
    NotFound,
    IsConnected,
    SendFile(String),
    SetConfiguration { output_buffering: bool },
}

pub(crate) const SEND_FROM_MEMORY: i32 = 0;
pub(crate) const GET_SERVER_VARIABLE: i32 = 1;
pub(crate) const SET_RESPONSE_HEADERS: i32 = 2;
pub(crate) const GET_LOCAL_PORT: i32 = 3;
pub(crate) const CLOSE: i32 = 4;
pub(crate) const SHOULD_CLIENT_BLOCK: i32 = 5;
pub(crate) const SETUP_CLIENT_BLOCK: i32 = 6;
pub(crate) const GET_CLIENT_BLOCK: i32 = 7;
pub(crate) const SET_STATUS: i32 = 8;
pub(crate) const DECLINE_REQUEST: i32 = 9;
pub(crate) const NOT_FOUND: i32 = 10;
pub(crate) const IS_CONNECTED: i32 = 11;
pub(crate) const SEND_FILE: i32 = 12;
pub(crate) const SET_CONFIGURATION: i32 = 13;

impl Command {
    /// Numeric opcode on the wire.
    pub fn code(&self) -> i32 {
        match self {
            Self::SendBytes(_) => SEND_FROM_MEMORY,
            Self::GetServerVariable(_) => GET_SERVER_VARIABLE,
            Self::SetResponseHeaders(_) => SET_RESPONSE_HEADERS,
            Self::GetLocalPort => GET_LOCAL_PORT,
            Self::Close => CLOSE,
            Self::ShouldClientBlock => SHOULD_CLIENT_BLOCK,
            Self::SetupClientBlock => SETUP_CLIENT_BLOCK,
            Self::GetClientBlock(_) => GET_CLIENT_BLOCK,
            Self::SetStatus { .. } => SET_STATUS,
            Self::Decline => DECLINE_REQUEST,
            Self::NotFound => NOT_FOUND,
            Self::IsConnected => IS_CONNECTED,
            Self::SendFile(_) => SEND_FILE,
            Self::SetConfiguration { .. } => SET_CONFIGURATION,
        }
    }

    /// Shape of the reply the requester must send back, if any.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            Self::GetServerVariable(_) => Some(ReplyKind::Variable),
            Self::GetLocalPort
            | Self::ShouldClientBlock
            | Self::SetupClientBlock
            | Self::IsConnected => Some(ReplyKind::Int),
            Self::GetClientBlock(_) => Some(ReplyKind::Block),
            _ => None,
        }
    }

    /// Whether the command ends the current exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Close | Self::Decline | Self::NotFound)
    }
}

/// Encode headers as the NUL separated `name\0value\0` blob.
pub(crate) fn join_headers(headers: &[(String, String)]) -> String {
    let mut blob = String::new();
    for (name, value) in headers {
        blob.push_str(name);
        blob.push('\0');
        blob.push_str(value);
        blob.push('\0');
    }
    blob
}

pub(crate) fn split_headers(blob: &str) -> Vec<(String, String)> {
    let mut parts = blob.split('\0');
    let mut headers = Vec::new();
    while let (Some(name), Some(value)) = (parts.next(), parts.next()) {
        if name.is_empty() {
            break;
        }
        headers.push((name.to_owned(), value.to_owned()));
    }
    headers
}

/// Reply shapes, selected by the command that was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Int,
    Variable,
    Block,
}

/// Requester's answer to a command that expects one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Int(i32),
    /// Server variable lookup; `None` when the variable is unset.
    Variable(Option<String>),
    /// Body block; `None` when reading failed (sent as length -1).
    Block(Option<Bytes>),
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Self::Int(_) => ReplyKind::Int,
            Self::Variable(_) => ReplyKind::Variable,
            Self::Block(_) => ReplyKind::Block,
        }
    }
}
