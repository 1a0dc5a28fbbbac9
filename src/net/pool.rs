//! Connection reuse pool.
//!
//! Workers hand finished keep-alive connections back to the acceptor through
//! this pool; the acceptor parks them in its idle set until the next request
//! arrives. Each connection carries its own reuse count, and the pool refuses
//! connections whose budget is spent.

use tokio::sync::mpsc;

use super::connection::Connection;

/// Handle given to workers for returning connections.
#[derive(Debug, Clone)]
pub struct ReusePool {
    tx: mpsc::UnboundedSender<Connection>,
    max_reuses: u32,
}

/// Acceptor side of the pool.
#[derive(Debug)]
pub struct ReturnedConnections {
    rx: mpsc::UnboundedReceiver<Connection>,
}

impl ReturnedConnections {
    pub async fn recv(&mut self) -> Option<Connection> {
        self.rx.recv().await
    }
}

impl ReusePool {
    pub fn channel(max_reuses: u32) -> (Self, ReturnedConnections) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, max_reuses }, ReturnedConnections { rx })
    }

    pub fn max_reuses(&self) -> u32 {
        self.max_reuses
    }

    /// How many more requests the connection may carry after the current one.
    pub fn remaining_budget(&self, conn: &Connection) -> u32 {
        self.max_reuses.saturating_sub(conn.reuses())
    }

    /// Return a connection for another request. Hands it back when the budget
    /// is spent or the acceptor has stopped.
    pub fn recycle(&self, mut conn: Connection) -> Result<(), Connection> {
        if self.remaining_budget(&conn) == 0 {
            return Err(conn);
        }
        conn.recycle();
        tracing::trace!(
            connection_id = %conn.id(),
            reuses = conn.reuses(),
            "Connection returned for reuse"
        );
        self.tx.send(conn).map_err(|e| e.0)
    }
}
