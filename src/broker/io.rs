//! Capabilities a worker exposes to backend contexts.
//!
//! Every worker provides the base [`RequestIo`] set. Workers that own the
//! response head (status line, headers, server variables) also provide
//! [`ResponseControl`], discovered through [`RequestIo::control`] rather than
//! by inspecting the concrete worker type.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

/// Byte-level operations on an in-flight request.
#[async_trait]
pub trait RequestIo: Send + Sync {
    /// Read up to `size` bytes of request body. Empty means end of body.
    async fn read(&self, size: usize) -> io::Result<Bytes>;

    /// Write response body bytes, sending the response head first if needed.
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    async fn flush(&self) -> io::Result<()>;

    /// Finish the response. Further writes are dropped.
    async fn close(&self);

    async fn is_connected(&self) -> bool;

    /// Extended response capability, when the worker has one.
    fn control(&self) -> Option<&dyn ResponseControl> {
        None
    }
}

/// Response-head and server-variable operations.
#[async_trait]
pub trait ResponseControl: Send + Sync {
    async fn set_status(&self, code: u16, reason: &str);

    /// Queue a response header; ignored once the head has been sent.
    async fn set_response_header(&self, name: &str, value: &str);

    async fn server_variable(&self, name: &str) -> Option<String>;

    /// Stream a file from disk as (part of) the response body.
    async fn send_file(&self, path: &str) -> io::Result<()>;

    fn local_port(&self) -> u16;

    async fn headers_sent(&self) -> bool;

    /// The backend refuses the request; the worker answers on its behalf.
    async fn decline(&self);

    /// The backend has no resource for the request.
    async fn not_found(&self);

    async fn set_output_buffering(&self, enabled: bool);
}
