//! Persistent channels to one backend process.
//!
//! # Responsibilities
//! - Keep idle channels for reuse, up to a cap
//! - Connect with bounded retries and exponential back-off
//! - Discard channels that failed mid-exchange
//!
//! # Design Decisions
//! - A checked-out channel is returned only by an explicit `release`;
//!   dropping the guard discards it
//! - The idle list lock is never held across an await

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{BackendError, Endpoint};
use crate::net::backoff::Backoff;
use crate::net::Stream;
use crate::protocol::RequesterChannel;

/// Channel pool tuning.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub connect_timeout: Duration,
    /// Idle channels kept open; extras are closed on release.
    pub max_idle: usize,
    /// Connect tries before the backend counts as unavailable.
    pub connect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_idle: 8,
            connect_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
        }
    }
}

/// Pool of channels to a single endpoint.
pub struct ChannelPool {
    endpoint: Endpoint,
    settings: ChannelSettings,
    idle: Mutex<Vec<RequesterChannel<Stream>>>,
    /// Channels currently checked out.
    busy: AtomicUsize,
}

impl ChannelPool {
    pub fn new(endpoint: Endpoint, settings: ChannelSettings) -> Self {
        Self {
            endpoint,
            settings,
            idle: Mutex::new(Vec::new()),
            busy: AtomicUsize::new(0),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn idle(&self) -> MutexGuard<'_, Vec<RequesterChannel<Stream>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    /// Take an idle channel or open a new one.
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledChannel, BackendError> {
        let reused = self.idle().pop();
        let (channel, reused) = match reused {
            Some(channel) => (channel, true),
            None => (self.open().await?, false),
        };
        Ok(self.guard(channel, reused))
    }

    /// Open a fresh channel, bypassing the idle list.
    pub async fn checkout_fresh(self: &Arc<Self>) -> Result<PooledChannel, BackendError> {
        let channel = self.open().await?;
        Ok(self.guard(channel, false))
    }

    fn guard(self: &Arc<Self>, channel: RequesterChannel<Stream>, reused: bool) -> PooledChannel {
        self.busy.fetch_add(1, Ordering::Relaxed);
        PooledChannel {
            pool: Arc::clone(self),
            channel: Some(channel),
            reused,
        }
    }

    async fn open(&self) -> Result<RequesterChannel<Stream>, BackendError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut backoff = Backoff::new(self.settings.backoff_base, self.settings.backoff_max);
        loop {
            let attempt = backoff.failures() + 1;
            match self.endpoint.connect(self.settings.connect_timeout).await {
                Ok(stream) => {
                    tracing::debug!(endpoint = %self.endpoint, attempt, "Backend channel opened");
                    return Ok(RequesterChannel::new(stream));
                }
                Err(err) if attempt < attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Backend connect failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn give_back(&self, channel: RequesterChannel<Stream>) {
        let mut idle = self.idle();
        if idle.len() < self.settings.max_idle {
            idle.push(channel);
        }
    }

    /// Announce shutdown on every idle channel and close them.
    pub async fn shutdown(&self) {
        let channels = std::mem::take(&mut *self.idle());
        let count = channels.len();
        for channel in channels {
            if let Err(e) = channel.announce_shutdown().await {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Shutdown notice failed");
            }
        }
        tracing::debug!(endpoint = %self.endpoint, channels = count, "Backend channels closed");
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("endpoint", &self.endpoint)
            .field("idle", &self.idle_count())
            .field("busy", &self.busy_count())
            .finish()
    }
}

/// A checked-out channel. Dropped without [`PooledChannel::release`], the
/// channel is closed rather than reused.
pub struct PooledChannel {
    pool: Arc<ChannelPool>,
    channel: Option<RequesterChannel<Stream>>,
    reused: bool,
}

impl PooledChannel {
    /// Whether the channel served an earlier exchange.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// Return a healthy channel to the pool.
    pub fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.give_back(channel);
        }
    }
}

impl Deref for PooledChannel {
    type Target = RequesterChannel<Stream>;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref().unwrap_or_else(|| unreachable!("channel taken before drop"))
    }
}

impl DerefMut for PooledChannel {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.channel.as_mut().unwrap_or_else(|| unreachable!("channel taken before drop"))
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.pool.busy.fetch_sub(1, Ordering::Relaxed);
        if self.channel.is_some() {
            tracing::debug!(endpoint = %self.pool.endpoint, "Discarding backend channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandlerChannel, Inbound};
    use tokio::net::TcpListener;

    fn settings() -> ChannelSettings {
        ChannelSettings {
            connect_timeout: Duration::from_millis(500),
            max_idle: 1,
            connect_attempts: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
        }
    }

    async fn pool() -> (Arc<ChannelPool>, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        (Arc::new(ChannelPool::new(endpoint, settings())), listener)
    }

    #[tokio::test]
    async fn released_channels_are_reused() {
        let (pool, _listener) = pool().await;

        let first = pool.checkout().await.unwrap();
        assert!(!first.was_reused());
        assert_eq!(pool.busy_count(), 1);
        first.release();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.busy_count(), 0);

        let second = pool.checkout().await.unwrap();
        assert!(second.was_reused());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn dropped_channels_are_discarded() {
        let (pool, _listener) = pool().await;
        let channel = pool.checkout().await.unwrap();
        drop(channel);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn idle_cap_is_enforced() {
        let (pool, _listener) = pool().await;
        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        a.release();
        b.release();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        drop(listener);

        let pool = Arc::new(ChannelPool::new(endpoint, settings()));
        let err = pool.checkout().await.err().unwrap();
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn shutdown_sends_notice_on_idle_channels() {
        let (pool, listener) = pool().await;
        pool.checkout().await.unwrap().release();
        let (server, _) = listener.accept().await.unwrap();

        pool.shutdown().await;
        assert_eq!(pool.idle_count(), 0);

        let inbound = HandlerChannel::new(Stream::from(server)).accept().await.unwrap();
        assert!(matches!(inbound, Inbound::Shutdown));
    }
}
