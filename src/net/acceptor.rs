//! Readiness loop over the listener and idle connections.
//!
//! # Responsibilities
//! - Accept connections and park them until they have bytes to read
//! - Hand readable connections to a worker task
//! - Park connections returned by workers for keep-alive
//! - Close connections idle longer than the idle timeout
//!
//! # Design Decisions
//! - The eviction tick is armed only while something is parked; with an
//!   empty idle set the loop blocks on the listener alone
//! - Accept errors pause accepting for a back-off delay; parked and
//!   returned connections keep being served meanwhile
//! - Each dispatch runs in its own task so a failing worker cannot take the
//!   loop down

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::connection::{Connection, ConnectionId, ConnectionTracker};
use super::listener::Listener;
use super::pool::ReturnedConnections;
use crate::observability::metrics;

/// Receives connections that are ready to be served.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, conn: Connection);
}

/// Acceptor timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct AcceptorConfig {
    /// Parked connections idle longer than this are closed.
    pub idle_timeout: Duration,
    /// How often parked connections are checked against the idle timeout.
    pub scan_interval: Duration,
    pub accept_backoff_base: Duration,
    pub accept_backoff_max: Duration,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            scan_interval: Duration::from_secs(1),
            accept_backoff_base: Duration::from_millis(10),
            accept_backoff_max: Duration::from_secs(1),
        }
    }
}

enum IdleEvent {
    Readable(Connection),
    Evicted(Connection),
    Failed(Connection, io::Error),
}

/// Parked connections waiting for their next request.
#[derive(Default)]
struct IdleSet {
    waiting: FuturesUnordered<BoxFuture<'static, IdleEvent>>,
    parked: HashMap<ConnectionId, (CancellationToken, Instant)>,
}

impl IdleSet {
    fn len(&self) -> usize {
        self.parked.len()
    }

    fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    fn park(&mut self, conn: Connection) {
        let token = CancellationToken::new();
        self.parked.insert(conn.id(), (token.clone(), Instant::now()));
        self.waiting.push(Box::pin(async move {
            let ready = tokio::select! {
                ready = conn.stream().readable() => Some(ready),
                _ = token.cancelled() => None,
            };
            match ready {
                Some(Ok(())) => IdleEvent::Readable(conn),
                Some(Err(e)) => IdleEvent::Failed(conn, e),
                None => IdleEvent::Evicted(conn),
            }
        }));
    }

    fn unpark(&mut self, id: ConnectionId) {
        self.parked.remove(&id);
    }

    /// Cancel every wait that outlived `idle_timeout`.
    fn expire(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let mut expired = 0;
        for (token, since) in self.parked.values() {
            if !token.is_cancelled() && now.saturating_duration_since(*since) > idle_timeout {
                token.cancel();
                expired += 1;
            }
        }
        expired
    }
}

/// Owns the listener and the idle set.
pub struct Acceptor {
    listener: Listener,
    returned: ReturnedConnections,
    idle: IdleSet,
    dispatcher: Arc<dyn Dispatch>,
    tracker: ConnectionTracker,
    config: AcceptorConfig,
    accept_backoff: Backoff,
    /// Set after an accept error; accepting resumes at this instant.
    accept_paused_until: Option<Instant>,
}

impl Acceptor {
    pub fn new(
        listener: Listener,
        returned: ReturnedConnections,
        dispatcher: Arc<dyn Dispatch>,
        tracker: ConnectionTracker,
        config: AcceptorConfig,
    ) -> Self {
        Self {
            listener,
            returned,
            idle: IdleSet::default(),
            dispatcher,
            tracker,
            config,
            accept_backoff: Backoff::new(config.accept_backoff_base, config.accept_backoff_max),
            accept_paused_until: None,
        }
    }

    /// Run until the shutdown signal fires. Parked connections are closed on
    /// exit; dispatched ones finish on their own.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut scan = tokio::time::interval(self.config.scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let scanning = !self.idle.is_empty();
            let paused = self.accept_paused_until.is_some();
            let resume_at = self.accept_paused_until.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(parked = self.idle.len(), "Acceptor stopping");
                    break;
                }
                accepted = self.listener.accept(), if !paused => match accepted {
                    Ok((stream, peer, permit)) => {
                        self.accept_backoff.reset();
                        stream.set_nodelay();
                        metrics::record_connection_accepted();
                        let conn = Connection::new(stream, peer, Some(permit));
                        tracing::debug!(connection_id = %conn.id(), peer_addr = %conn.peer(), "Connection parked");
                        self.idle.park(conn);
                    }
                    Err(e) => {
                        let delay = self.accept_backoff.next_delay();
                        tracing::warn!(
                            error = %e,
                            failures = self.accept_backoff.failures(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Accept failed"
                        );
                        self.accept_paused_until = Some(Instant::now() + delay);
                    }
                },
                _ = tokio::time::sleep_until(resume_at), if paused => {
                    self.accept_paused_until = None;
                },
                Some(conn) = self.returned.recv() => {
                    metrics::record_connection_reused();
                    if conn.has_buffered_input() {
                        self.spawn_worker(conn);
                    } else {
                        self.idle.park(conn);
                    }
                }
                Some(event) = self.idle.waiting.next(), if scanning => match event {
                    IdleEvent::Readable(conn) => {
                        self.idle.unpark(conn.id());
                        self.spawn_worker(conn);
                    }
                    IdleEvent::Evicted(conn) => {
                        self.idle.unpark(conn.id());
                        tracing::debug!(connection_id = %conn.id(), "Idle connection closed");
                    }
                    IdleEvent::Failed(conn, e) => {
                        self.idle.unpark(conn.id());
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Parked connection failed");
                    }
                },
                _ = scan.tick(), if scanning => {
                    let expired = self.idle.expire(Instant::now(), self.config.idle_timeout);
                    if expired > 0 {
                        metrics::record_idle_eviction(expired);
                        tracing::debug!(expired, parked = self.idle.len(), "Evicting idle connections");
                    }
                }
            }
        }
    }

    fn spawn_worker(&self, conn: Connection) {
        let guard = self.tracker.track(conn.id());
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let _guard = guard;
            dispatcher.dispatch(conn).await;
        });
    }
}
