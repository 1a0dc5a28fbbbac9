//! Error taxonomy for the wire protocol.

use std::io;

use thiserror::Error;

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer announced a protocol revision we do not speak.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version byte this side speaks.
        expected: u8,
        /// Version byte the peer sent.
        actual: u8,
    },

    /// A length-prefixed field exceeded its bound or was negative.
    #[error("{field} length {length} outside 0..={max}")]
    OversizedField {
        /// Logical name of the offending field.
        field: &'static str,
        /// Length announced by the peer.
        length: i64,
        /// Largest length accepted for the field.
        max: usize,
    },

    /// A string field did not hold valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Logical name of the offending field.
        field: &'static str,
    },

    /// The peer sent an opcode this side does not know.
    #[error("unknown command code {0}")]
    UnknownCommand(i32),

    /// A command arrived where a reply was expected, or the reverse.
    #[error("unexpected frame: {0}")]
    Unexpected(&'static str),

    /// The initial block ended before all of its fields were read.
    #[error("initial request block truncated while reading {0}")]
    Truncated(&'static str),

    /// The stream closed in the middle of a frame.
    #[error("connection closed mid-frame")]
    ConnectionClosed,

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True for violations that indicate a hostile or broken peer rather than
    /// a transport fault.
    pub fn is_violation(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::OversizedField { .. } => "oversized_field",
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::UnknownCommand(_) => "unknown_command",
            Self::Unexpected(_) => "unexpected_frame",
            Self::Truncated(_) => "truncated",
            Self::ConnectionClosed => "connection_closed",
            Self::Io(_) => "io",
        }
    }
}
