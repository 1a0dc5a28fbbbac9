//! Primitive field encoding shared by both codecs.
//!
//! Integers are little-endian 32-bit signed. Strings are an `i32` byte count
//! followed by UTF-8 bytes; the count is validated before any byte of the
//! payload is awaited, so an oversized announcement fails immediately instead
//! of buffering.

use bytes::{BufMut, BytesMut};

use super::error::ProtocolError;

/// Protocol revision spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 9;

/// Tag sent in place of a version byte when the requester is going away.
pub const SHUTDOWN_TAG: u8 = 0;

/// Largest accepted string field, in bytes.
pub const MAX_STRING_SIZE: usize = 10 * 1024;

/// Largest accepted initial request block, in bytes.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Largest accepted body chunk carried by a single command or reply.
pub const MAX_BODY_CHUNK: usize = 16 * 1024 * 1024;

pub(crate) fn put_i32(dst: &mut BytesMut, value: i32) {
    dst.put_i32_le(value);
}

pub(crate) fn put_string(
    dst: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), ProtocolError> {
    if value.len() > MAX_STRING_SIZE {
        return Err(ProtocolError::OversizedField {
            field,
            length: value.len() as i64,
            max: MAX_STRING_SIZE,
        });
    }
    dst.reserve(4 + value.len());
    dst.put_i32_le(value.len() as i32);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_chunk(
    dst: &mut BytesMut,
    field: &'static str,
    data: &[u8],
) -> Result<(), ProtocolError> {
    check_length(field, data.len() as i64, MAX_BODY_CHUNK)?;
    dst.reserve(4 + data.len());
    dst.put_i32_le(data.len() as i32);
    dst.put_slice(data);
    Ok(())
}

pub(crate) fn check_length(
    field: &'static str,
    length: i64,
    max: usize,
) -> Result<usize, ProtocolError> {
    if length < 0 || length > max as i64 {
        return Err(ProtocolError::OversizedField { field, length, max });
    }
    Ok(length as usize)
}

/// Non-consuming cursor over a partially received buffer.
///
/// Every accessor returns `None` when the buffer does not yet hold the
/// requested bytes; the caller decides whether that means "wait for more"
/// (streaming decode) or "truncated" (complete block).
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn consumed(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    pub(crate) fn i32(&mut self) -> Option<i32> {
        let raw = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let raw = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(raw)
    }

    /// Length-prefixed byte run bounded by `max`.
    pub(crate) fn chunk(
        &mut self,
        field: &'static str,
        max: usize,
    ) -> Result<Option<&'a [u8]>, ProtocolError> {
        let Some(length) = self.i32() else {
            return Ok(None);
        };
        let length = check_length(field, i64::from(length), max)?;
        Ok(self.bytes(length))
    }

    pub(crate) fn string(&mut self, field: &'static str) -> Result<Option<String>, ProtocolError> {
        let Some(raw) = self.chunk(field, MAX_STRING_SIZE)? else {
            return Ok(None);
        };
        std::str::from_utf8(raw)
            .map(|s| Some(s.to_owned()))
            .map_err(|_| ProtocolError::InvalidUtf8 { field })
    }
}
