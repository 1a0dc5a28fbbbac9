//! Listening socket with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured TCP address or Unix-domain socket path
//! - Accept incoming connections
//! - Enforce max_connections limit via semaphore

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::stream::{PeerAddr, Stream};
use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

enum Socket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// A bounded listener that limits concurrent connections.
///
/// When the limit is reached, `accept` waits until a slot frees up.
pub struct Listener {
    inner: Socket,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    ///
    /// Addresses of the form `unix:/path/to.sock` bind a Unix-domain socket,
    /// replacing a stale socket file left by a previous run.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let inner = match config.bind_address.strip_prefix("unix:") {
            #[cfg(unix)]
            Some(path) => {
                let path = PathBuf::from(path);
                if path.exists() {
                    std::fs::remove_file(&path).map_err(ListenerError::Bind)?;
                }
                let listener = UnixListener::bind(&path).map_err(ListenerError::Bind)?;
                tracing::info!(
                    path = %path.display(),
                    max_connections = config.max_connections,
                    "Listener bound"
                );
                Socket::Unix(listener, path)
            }
            #[cfg(not(unix))]
            Some(_) => {
                return Err(ListenerError::Bind(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
            None => {
                let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
                    ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
                })?;
                let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
                let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;
                tracing::info!(
                    address = %local_addr,
                    max_connections = config.max_connections,
                    "Listener bound"
                );
                Socket::Tcp(listener)
            }
        };

        Ok(Self::with_socket(inner, config.max_connections))
    }

    /// Wrap an already bound TCP listener.
    pub fn from_tcp(listener: TcpListener, max_connections: usize) -> Self {
        Self::with_socket(Socket::Tcp(listener), max_connections)
    }

    fn with_socket(inner: Socket, max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Cancel safe: dropping the future before a connection arrives releases
    /// the permit.
    pub async fn accept(&self) -> Result<(Stream, PeerAddr, ConnectionPermit), ListenerError> {
        // Permit first (backpressure). The semaphore is never closed.
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|e| ListenerError::Accept(std::io::Error::other(e)))?;

        let (stream, peer) = match &self.inner {
            Socket::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(ListenerError::Accept)?;
                (Stream::from(stream), PeerAddr::Tcp(addr))
            }
            #[cfg(unix)]
            Socket::Unix(listener, _) => {
                let (stream, _) = listener.accept().await.map_err(ListenerError::Accept)?;
                (Stream::from(stream), PeerAddr::Local)
            }
        };

        tracing::debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// The TCP address this listener is bound to, if it is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Socket::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Socket::Unix(..) => None,
        }
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Socket::Unix(_, path) = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_track_open_connections() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::from_tcp(tcp, 2);

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_stream, peer, permit) = listener.accept().await.unwrap();
        assert!(matches!(peer, PeerAddr::Tcp(_)));
        assert_eq!(listener.available_permits(), 1);

        drop(permit);
        assert_eq!(listener.available_permits(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn binds_unix_socket_and_cleans_up() {
        let path = std::env::temp_dir().join(format!("hostbridge-test-{}.sock", std::process::id()));
        let config = ListenerConfig {
            bind_address: format!("unix:{}", path.display()),
            ..Default::default()
        };
        let listener = Listener::bind(&config).await.unwrap();
        assert!(path.exists());
        assert!(listener.local_addr().is_none());

        let _client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (_stream, peer, _permit) = listener.accept().await.unwrap();
        assert_eq!(peer, PeerAddr::Local);

        drop(listener);
        assert!(!path.exists());
    }
}
