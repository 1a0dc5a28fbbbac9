//! Backend process addresses.

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use super::BackendError;
use crate::net::Stream;

/// Where a backend process listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    /// `unix:/path/to/socket`
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(value: &str) -> Result<Self, BackendError> {
        let value = value.trim();
        if let Some(path) = value.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(BackendError::InvalidEndpoint(value.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(value.to_string()))
            }
            _ => Err(BackendError::InvalidEndpoint(value.to_string())),
        }
    }

    /// Open a connection, giving up after `timeout`.
    pub async fn connect(&self, timeout: Duration) -> Result<Stream, BackendError> {
        let unavailable = |source: std::io::Error| BackendError::Unavailable {
            endpoint: self.to_string(),
            source,
        };
        let timed_out = || {
            unavailable(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        };

        match self {
            Self::Tcp(addr) => {
                let stream = tokio::time::timeout(timeout, TcpStream::connect(addr.as_str()))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(unavailable)?;
                let _ = stream.set_nodelay(true);
                Ok(Stream::from(stream))
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(unavailable)?;
                Ok(Stream::from(stream))
            }
            #[cfg(not(unix))]
            Self::Unix(_) => Err(unavailable(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
