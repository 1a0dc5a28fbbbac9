//! Binary command protocol between the front end and backend contexts.
//!
//! # Data Flow
//! ```text
//! Requester (owns the client socket)           Handler (runs the application)
//!     begin(InitialRequest) ── tag 9 + block ──▶ accept() → HandlerSession
//!                           ◀── SetStatus ──────
//!                           ◀── GetClientBlock ─
//!     reply(Block)          ── n + bytes ──────▶
//!                           ◀── SetResponseHeaders (once)
//!                           ◀── SendBytes ──────
//!                           ◀── Close ──────────  → back to HandlerChannel
//!     announce_shutdown()   ── tag 0 ──────────▶ Inbound::Shutdown
//! ```
//!
//! # Design Decisions
//! - Little-endian fixed-width integers, length-prefixed UTF-8 strings
//! - Every length is bounded and checked before its payload is awaited
//! - Half-duplex: at most one outstanding command per channel

pub mod codec;
pub mod error;
pub mod message;
pub mod session;
pub mod wire;

pub use codec::{HandlerCodec, HandlerFrame, RequesterCodec};
pub use error::ProtocolError;
pub use message::{Command, Handshake, InitialRequest, Reply, ReplyKind};
pub use session::{HandlerChannel, HandlerSession, Inbound, RequesterChannel};
pub use wire::{MAX_STRING_SIZE, PROTOCOL_VERSION};
