//! `tokio_util` codecs for both ends of a channel.
//!
//! The protocol is half-duplex and untagged: a reply carries no opcode, so its
//! layout is only known to the side that issued the command. The handler codec
//! therefore has to be told which reply shape it is waiting for.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::ProtocolError;
use super::message::*;
use super::wire::{self, FieldReader, MAX_BLOCK_SIZE, MAX_BODY_CHUNK, PROTOCOL_VERSION, SHUTDOWN_TAG};

/// Frames decoded by the handler side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerFrame {
    Handshake(Handshake),
    Reply(Reply),
}

/// Codec for the side that receives requests and issues commands.
#[derive(Debug, Default)]
pub struct HandlerCodec {
    expecting: Option<ReplyKind>,
}

impl HandlerCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next frame as a reply of the given shape.
    pub fn expect_reply(&mut self, kind: ReplyKind) {
        self.expecting = Some(kind);
    }

    fn decode_handshake(src: &mut BytesMut) -> Result<Option<Handshake>, ProtocolError> {
        let mut r = FieldReader::new(src);
        let Some(tag) = r.u8() else {
            return Ok(None);
        };
        if tag == SHUTDOWN_TAG {
            src.advance(1);
            return Ok(Some(Handshake::Shutdown));
        }
        if tag != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: tag,
            });
        }
        let Some(block) = r.chunk("initial block", MAX_BLOCK_SIZE)? else {
            src.reserve(5);
            return Ok(None);
        };
        let request = InitialRequest::decode_block(block)?;
        let consumed = r.consumed();
        src.advance(consumed);
        Ok(Some(Handshake::Request(request)))
    }

    fn decode_reply(kind: ReplyKind, src: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
        let mut r = FieldReader::new(src);
        let reply = match kind {
            ReplyKind::Int => match r.i32() {
                Some(value) => Reply::Int(value),
                None => return Ok(None),
            },
            ReplyKind::Variable => match r.u8() {
                None => return Ok(None),
                Some(0) => Reply::Variable(None),
                Some(_) => match r.string("server variable")? {
                    Some(value) => Reply::Variable(Some(value)),
                    None => return Ok(None),
                },
            },
            ReplyKind::Block => match r.i32() {
                None => return Ok(None),
                Some(-1) => Reply::Block(None),
                Some(len) => {
                    let len = wire::check_length("client block", i64::from(len), MAX_BODY_CHUNK)?;
                    match r.bytes(len) {
                        Some(data) => Reply::Block(Some(Bytes::copy_from_slice(data))),
                        None => return Ok(None),
                    }
                }
            },
        };
        let consumed = r.consumed();
        src.advance(consumed);
        Ok(Some(reply))
    }
}

impl Decoder for HandlerCodec {
    type Item = HandlerFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.expecting {
            Some(kind) => {
                let reply = Self::decode_reply(kind, src)?;
                if reply.is_some() {
                    self.expecting = None;
                }
                Ok(reply.map(HandlerFrame::Reply))
            }
            None => Ok(Self::decode_handshake(src)?.map(HandlerFrame::Handshake)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

impl Encoder<Command> for HandlerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        wire::put_i32(dst, command.code());
        match command {
            Command::SendBytes(data) => wire::put_chunk(dst, "response body", &data)?,
            Command::GetServerVariable(name) => wire::put_string(dst, "variable name", &name)?,
            Command::SetResponseHeaders(headers) => {
                wire::put_string(dst, "response headers", &join_headers(&headers))?
            }
            Command::GetClientBlock(size) => wire::put_i32(dst, size),
            Command::SetStatus { code, status_line } => {
                wire::put_i32(dst, code);
                wire::put_string(dst, "status line", &status_line)?;
            }
            Command::SendFile(name) => wire::put_string(dst, "file name", &name)?,
            Command::SetConfiguration { output_buffering } => dst.put_u8(u8::from(output_buffering)),
            Command::GetLocalPort
            | Command::Close
            | Command::ShouldClientBlock
            | Command::SetupClientBlock
            | Command::Decline
            | Command::NotFound
            | Command::IsConnected => {}
        }
        Ok(())
    }
}

/// Codec for the side that originates requests and executes commands.
#[derive(Debug, Default)]
pub struct RequesterCodec;

impl RequesterCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RequesterCodec {
    type Item = Command;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut r = FieldReader::new(src);
        let Some(code) = r.i32() else {
            return Ok(None);
        };
        let command = match code {
            SEND_FROM_MEMORY => match r.chunk("response body", MAX_BODY_CHUNK)? {
                Some(data) => Command::SendBytes(Bytes::copy_from_slice(data)),
                None => return Ok(None),
            },
            GET_SERVER_VARIABLE => match r.string("variable name")? {
                Some(name) => Command::GetServerVariable(name),
                None => return Ok(None),
            },
            SET_RESPONSE_HEADERS => match r.string("response headers")? {
                Some(blob) => Command::SetResponseHeaders(split_headers(&blob)),
                None => return Ok(None),
            },
            GET_LOCAL_PORT => Command::GetLocalPort,
            CLOSE => Command::Close,
            SHOULD_CLIENT_BLOCK => Command::ShouldClientBlock,
            SETUP_CLIENT_BLOCK => Command::SetupClientBlock,
            GET_CLIENT_BLOCK => match r.i32() {
                Some(size) => Command::GetClientBlock(size),
                None => return Ok(None),
            },
            SET_STATUS => {
                let Some(code) = r.i32() else {
                    return Ok(None);
                };
                match r.string("status line")? {
                    Some(status_line) => Command::SetStatus { code, status_line },
                    None => return Ok(None),
                }
            }
            DECLINE_REQUEST => Command::Decline,
            NOT_FOUND => Command::NotFound,
            IS_CONNECTED => Command::IsConnected,
            SEND_FILE => match r.string("file name")? {
                Some(name) => Command::SendFile(name),
                None => return Ok(None),
            },
            SET_CONFIGURATION => match r.u8() {
                Some(flag) => Command::SetConfiguration {
                    output_buffering: flag != 0,
                },
                None => return Ok(None),
            },
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        let consumed = r.consumed();
        src.advance(consumed);
        Ok(Some(command))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

impl Encoder<Handshake> for RequesterCodec {
    type Error = ProtocolError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let request = match handshake {
            Handshake::Shutdown => {
                dst.put_u8(SHUTDOWN_TAG);
                return Ok(());
            }
            Handshake::Request(request) => request,
        };
        let mut block = BytesMut::new();
        request.encode_block(&mut block)?;
        wire::check_length("initial block", block.len() as i64, MAX_BLOCK_SIZE)?;
        dst.reserve(5 + block.len());
        dst.put_u8(PROTOCOL_VERSION);
        wire::put_i32(dst, block.len() as i32);
        dst.extend_from_slice(&block);
        Ok(())
    }
}

impl Encoder<Reply> for RequesterCodec {
    type Error = ProtocolError;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match reply {
            Reply::Int(value) => wire::put_i32(dst, value),
            Reply::Variable(None) => dst.put_u8(0),
            Reply::Variable(Some(value)) => {
                dst.put_u8(1);
                wire::put_string(dst, "server variable", &value)?;
            }
            Reply::Block(None) => wire::put_i32(dst, -1),
            Reply::Block(Some(data)) => wire::put_chunk(dst, "client block", &data)?,
        }
        Ok(())
    }
}
