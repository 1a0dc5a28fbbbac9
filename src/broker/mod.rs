//! Request broker subsystem.
//!
//! # Data Flow
//! ```text
//! Worker ──register(worker)──▶ RequestBroker ──▶ RequestId
//!                                  │
//! Backend context ─read/write(id)─▶ lookup(id) ─▶ Arc<dyn RequestIo> ─▶ Worker I/O
//!                                  │   (table lock released before the call)
//! Worker ──unregister(id)────────▶ completion broadcast (exactly once)
//! ```
//!
//! # Design Decisions
//! - Backends hold plain ids, never worker references
//! - Unknown or stale ids turn every operation into a no-op
//! - One coarse lock; forwarded I/O never runs under it

pub mod id;
pub mod io;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub use id::RequestId;
pub use io::{RequestIo, ResponseControl};

use crate::observability::metrics;
use id::{next_serial, MAX_SLOTS};

/// Broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Every slot of the id table is taken.
    #[error("request table full ({capacity} in-flight requests)")]
    Exhausted {
        /// Number of slots in the table.
        capacity: usize,
    },
}

struct Slot {
    id: RequestId,
    worker: Arc<dyn RequestIo>,
}

struct BrokerTable {
    slots: Vec<Option<Slot>>,
    serial: u32,
    live: usize,
}

/// Maps request ids to the workers that own them.
pub struct RequestBroker {
    table: Mutex<BrokerTable>,
    completed: broadcast::Sender<RequestId>,
    capacity: usize,
}

impl RequestBroker {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SLOTS)
    }

    /// Broker with a smaller slot table.
    pub fn with_capacity(capacity: usize) -> Self {
        let (completed, _) = broadcast::channel(1024);
        Self {
            table: Mutex::new(BrokerTable {
                slots: Vec::new(),
                serial: 0,
                live: 0,
            }),
            completed,
            capacity: capacity.clamp(1, MAX_SLOTS),
        }
    }

    fn table(&self) -> MutexGuard<'_, BrokerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker and hand out its id.
    pub fn register(&self, worker: Arc<dyn RequestIo>) -> Result<RequestId, BrokerError> {
        let mut table = self.table();
        let index = match table.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if table.slots.len() < self.capacity => {
                table.slots.push(None);
                table.slots.len() - 1
            }
            None => {
                return Err(BrokerError::Exhausted {
                    capacity: self.capacity,
                })
            }
        };
        table.serial = next_serial(table.serial);
        let id = RequestId::compose(index, table.serial);
        table.slots[index] = Some(Slot { id, worker });
        table.live += 1;
        metrics::set_inflight_requests(table.live);
        tracing::trace!(request_id = %id, live = table.live, "Request registered");
        Ok(id)
    }

    /// Drop a registration and announce its completion. Unknown ids are
    /// ignored; returns whether anything was removed.
    pub fn unregister(&self, id: RequestId) -> bool {
        let removed = {
            let mut guard = self.table();
            let table = &mut *guard;
            match table.slots.get_mut(id.slot()) {
                Some(slot) if slot.as_ref().is_some_and(|s| s.id == id) => {
                    *slot = None;
                    table.live -= 1;
                    metrics::set_inflight_requests(table.live);
                    true
                }
                _ => false,
            }
        };
        if removed {
            // No subscribers is fine.
            let _ = self.completed.send(id);
            tracing::trace!(request_id = %id, "Request unregistered");
        }
        removed
    }

    /// Completion notifications for every request unregistered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RequestId> {
        self.completed.subscribe()
    }

    pub fn live_count(&self) -> usize {
        self.table().live
    }

    pub fn is_registered(&self, id: RequestId) -> bool {
        self.lookup(id).is_some()
    }

    fn lookup(&self, id: RequestId) -> Option<Arc<dyn RequestIo>> {
        let table = self.table();
        match table.slots.get(id.slot()) {
            Some(Some(slot)) if slot.id == id => Some(Arc::clone(&slot.worker)),
            _ => None,
        }
    }

    pub async fn read(&self, id: RequestId, size: usize) -> std::io::Result<Bytes> {
        match self.lookup(id) {
            Some(worker) => worker.read(size).await,
            None => Ok(Bytes::new()),
        }
    }

    pub async fn write(&self, id: RequestId, data: &[u8]) -> std::io::Result<()> {
        match self.lookup(id) {
            Some(worker) => worker.write(data).await,
            None => Ok(()),
        }
    }

    pub async fn flush(&self, id: RequestId) -> std::io::Result<()> {
        match self.lookup(id) {
            Some(worker) => worker.flush().await,
            None => Ok(()),
        }
    }

    pub async fn close(&self, id: RequestId) {
        if let Some(worker) = self.lookup(id) {
            worker.close().await;
        }
    }

    pub async fn is_connected(&self, id: RequestId) -> bool {
        match self.lookup(id) {
            Some(worker) => worker.is_connected().await,
            None => false,
        }
    }

    pub async fn set_status(&self, id: RequestId, code: u16, reason: &str) {
        if let Some(worker) = self.lookup(id) {
            if let Some(control) = worker.control() {
                control.set_status(code, reason).await;
            }
        }
    }

    pub async fn set_response_header(&self, id: RequestId, name: &str, value: &str) {
        if let Some(worker) = self.lookup(id) {
            if let Some(control) = worker.control() {
                control.set_response_header(name, value).await;
            }
        }
    }

    pub async fn server_variable(&self, id: RequestId, name: &str) -> Option<String> {
        let worker = self.lookup(id)?;
        let control = worker.control()?;
        control.server_variable(name).await
    }

    pub async fn send_file(&self, id: RequestId, path: &str) -> std::io::Result<()> {
        match self.lookup(id) {
            Some(worker) => match worker.control() {
                Some(control) => control.send_file(path).await,
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    pub fn local_port(&self, id: RequestId) -> Option<u16> {
        let worker = self.lookup(id)?;
        let port = worker.control()?.local_port();
        Some(port)
    }

    pub async fn headers_sent(&self, id: RequestId) -> bool {
        match self.lookup(id) {
            Some(worker) => match worker.control() {
                Some(control) => control.headers_sent().await,
                None => false,
            },
            None => false,
        }
    }

    pub async fn decline(&self, id: RequestId) {
        if let Some(worker) = self.lookup(id) {
            if let Some(control) = worker.control() {
                control.decline().await;
            }
        }
    }

    pub async fn not_found(&self, id: RequestId) {
        if let Some(worker) = self.lookup(id) {
            if let Some(control) = worker.control() {
                control.not_found().await;
            }
        }
    }

    pub async fn set_output_buffering(&self, id: RequestId, enabled: bool) {
        if let Some(worker) = self.lookup(id) {
            if let Some(control) = worker.control() {
                control.set_output_buffering(enabled).await;
            }
        }
    }
}

impl Default for RequestBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBroker")
            .field("live", &self.live_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
