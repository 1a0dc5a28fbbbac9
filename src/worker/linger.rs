//! Lingering close.
//!
//! Shutting down the write half and draining what the client still sends
//! lets the response reach the client before the socket is torn down;
//! closing with unread input would make the kernel reset the connection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::net::Connection;

/// Limits for draining a closing connection.
#[derive(Debug, Clone, Copy)]
pub struct LingerConfig {
    /// Longest wait for a single read.
    pub per_read: Duration,
    /// Longest total drain time.
    pub total: Duration,
    /// Most bytes discarded before giving up.
    pub max_bytes: usize,
}

impl Default for LingerConfig {
    fn default() -> Self {
        Self {
            per_read: Duration::from_secs(2),
            total: Duration::from_secs(30),
            max_bytes: 64 * 1024,
        }
    }
}

/// Close `conn` gracefully. Returns the number of bytes discarded.
pub async fn linger_close(mut conn: Connection, config: LingerConfig) -> usize {
    let id = conn.id();
    let stream = conn.stream_mut();
    if let Err(e) = stream.shutdown().await {
        tracing::trace!(connection_id = %id, error = %e, "Write shutdown failed");
        return 0;
    }

    let deadline = Instant::now() + config.total;
    let mut buf = [0u8; 512];
    let mut discarded = 0;
    while discarded < config.max_bytes {
        let wait = config.per_read.min(deadline.saturating_duration_since(Instant::now()));
        if wait.is_zero() {
            break;
        }
        match tokio::time::timeout(wait, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => discarded += n,
        }
    }
    tracing::trace!(connection_id = %id, discarded, "Connection closed");
    discarded
}
