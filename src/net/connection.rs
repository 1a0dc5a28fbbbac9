//! Accepted connections and worker tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry a socket together with bytes read ahead of the current request,
//!   its last-activity time and its reuse count
//! - Count active workers for graceful shutdown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;

use super::listener::ConnectionPermit;
use super::stream::{PeerAddr, Stream};
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An accepted socket between requests.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: Stream,
    buffer: BytesMut,
    peer: PeerAddr,
    local: PeerAddr,
    last_activity: Instant,
    reuses: u32,
    _permit: Option<ConnectionPermit>,
}

impl Connection {
    pub fn new(stream: Stream, peer: PeerAddr, permit: Option<ConnectionPermit>) -> Self {
        let local = stream.local_addr();
        Self {
            id: ConnectionId::new(),
            stream,
            buffer: BytesMut::new(),
            peer,
            local,
            last_activity: Instant::now(),
            reuses: 0,
            _permit: permit,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn local(&self) -> &PeerAddr {
        &self.local
    }

    /// Number of requests served on this socket before the current one.
    pub fn reuses(&self) -> u32 {
        self.reuses
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    /// Bytes already read from the socket but not yet consumed.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Socket and read-ahead buffer together, for parsers that fill one from
    /// the other.
    pub fn io_mut(&mut self) -> (&mut Stream, &mut BytesMut) {
        (&mut self.stream, &mut self.buffer)
    }

    pub fn has_buffered_input(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn set_buffer(&mut self, buffer: BytesMut) {
        self.buffer = buffer;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Prepare the connection for another request.
    pub fn recycle(&mut self) {
        self.reuses += 1;
        self.touch();
    }

    /// Lend the socket and its read-ahead bytes to a framed codec.
    pub fn detach(self) -> (Stream, BytesMut, DetachedConnection) {
        let detached = DetachedConnection {
            id: self.id,
            peer: self.peer,
            local: self.local,
            reuses: self.reuses,
            _permit: self._permit,
        };
        (self.stream, self.buffer, detached)
    }
}

/// A connection whose socket is currently lent out.
#[derive(Debug)]
pub struct DetachedConnection {
    id: ConnectionId,
    peer: PeerAddr,
    local: PeerAddr,
    reuses: u32,
    _permit: Option<ConnectionPermit>,
}

impl DetachedConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn local(&self) -> &PeerAddr {
        &self.local
    }

    /// Put the socket back, together with bytes read past the last frame.
    pub fn reattach(self, stream: Stream, buffer: BytesMut) -> Connection {
        Connection {
            id: self.id,
            stream,
            buffer,
            peer: self.peer,
            local: self.local,
            last_activity: Instant::now(),
            reuses: self.reuses,
            _permit: self._permit,
        }
    }
}

/// Tracks active workers for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of active workers.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active worker. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        let active = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_workers(active);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active worker count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all workers have finished or `limit` elapses. Returns
    /// whether everything finished in time.
    pub async fn wait_for_shutdown(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

/// Guard that tracks a worker's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get the ID of the connection being served.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_workers(active);
        tracing::trace!(connection_id = %self.id, "Worker finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_wait_gives_up_after_limit() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(ConnectionId::new());
        assert!(!tracker.wait_for_shutdown(Duration::from_millis(120)).await);
        drop(guard);
        assert!(tracker.wait_for_shutdown(Duration::from_millis(120)).await);
    }

    #[tokio::test]
    async fn recycle_counts_reuses() {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::TcpStream::connect(tcp.local_addr().unwrap()).await.unwrap();
        let peer = client.peer_addr().unwrap();
        let mut conn = Connection::new(Stream::from(client), PeerAddr::Tcp(peer), None);

        assert_eq!(conn.reuses(), 0);
        conn.recycle();
        conn.recycle();
        assert_eq!(conn.reuses(), 2);
        assert!(conn.idle_for(Instant::now()) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn detach_and_reattach_keep_identity() {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::TcpStream::connect(tcp.local_addr().unwrap()).await.unwrap();
        let peer = client.peer_addr().unwrap();
        let mut conn = Connection::new(Stream::from(client), PeerAddr::Tcp(peer), None);
        conn.recycle();
        conn.set_buffer(BytesMut::from(&b"ahead"[..]));
        let id = conn.id();

        let (stream, buffer, detached) = conn.detach();
        assert_eq!(&buffer[..], b"ahead");
        let conn = detached.reattach(stream, BytesMut::from(&b"left"[..]));
        assert_eq!(conn.id(), id);
        assert_eq!(conn.reuses(), 1);
        assert!(conn.has_buffered_input());
    }
}
