//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming connection (TCP or Unix socket)
//!     → listener.rs (accept, connection limits)
//!     → acceptor.rs (park in idle set, wait for readability, evict idle)
//!     → Dispatch::dispatch → worker task
//!     → pool.rs (keep-alive: worker hands the connection back)
//!     → acceptor.rs (parked again, reuse count + 1)
//!
//! Connection States:
//!     Accepted → Parked → Dispatched → (Parked | Closed)
//! ```
//!
//! # Design Decisions
//! - Bounded accept via semaphore prevents resource exhaustion
//! - Idle sockets cost one parked future, no task
//! - Each worker tracked for graceful shutdown

pub mod acceptor;
pub mod backoff;
pub mod connection;
pub mod listener;
pub mod pool;
pub mod stream;

pub use acceptor::{Acceptor, AcceptorConfig, Dispatch};
pub use connection::{Connection, ConnectionId, ConnectionTracker, DetachedConnection};
pub use listener::{Listener, ListenerError};
pub use pool::{ReturnedConnections, ReusePool};
pub use stream::{PeerAddr, Stream};
