/// Fixed-size connection pool for one server
///
/// The pool opens a configured number of connections up front and hands them
/// out round-robin. Checkout is synchronous and never blocks on I/O: a dead
/// connection is simply skipped, and the HA monitor refills the pool on its
/// next tick.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::connection::Connection;
use crate::core::{ConnectionEvent, ServerAddress};
use crate::error::{DriverError, DriverResult};

pub struct ConnectionPool {
    address: ServerAddress,
    size: usize,
    connect_timeout: Duration,
    max_message_size: usize,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    connections: RwLock<Vec<Arc<Connection>>>,
    cursor: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(
        address: ServerAddress,
        size: usize,
        connect_timeout: Duration,
        max_message_size: usize,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            address,
            size,
            connect_timeout,
            max_message_size,
            events,
            connections: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Open the configured number of connections. Partial failure is
    /// tolerated as long as at least one connection comes up; total failure
    /// is the caller's signal that the server is down.
    pub async fn start(&self) -> DriverResult<()> {
        let mut opened = Vec::with_capacity(self.size);
        let mut last_error = None;
        for _ in 0..self.size {
            match Connection::open(
                self.address.clone(),
                self.connect_timeout,
                self.max_message_size,
                self.events.clone(),
            )
            .await
            {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    warn!("Failed to open connection to {}: {}", self.address, e);
                    last_error = Some(e);
                }
            }
        }

        if opened.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| DriverError::internal("pool started with size zero")));
        }

        debug!(
            "Pool for {} started with {}/{} connections",
            self.address,
            opened.len(),
            self.size
        );
        let mut slot = write_lock(&self.connections);
        for conn in slot.drain(..) {
            conn.close();
        }
        *slot = opened;
        Ok(())
    }

    /// Hand out the next live connection, round-robin. Dead connections are
    /// skipped and dropped from the pool.
    pub fn checkout(&self) -> DriverResult<Arc<Connection>> {
        {
            let connections = read_lock(&self.connections);
            if !connections.is_empty() {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                for i in 0..connections.len() {
                    let conn = &connections[(start + i) % connections.len()];
                    if conn.is_connected() {
                        return Ok(Arc::clone(conn));
                    }
                }
            }
        }

        // Everything in the pool is dead; drop the corpses so the next
        // refill starts clean.
        let mut connections = write_lock(&self.connections);
        connections.retain(|c| c.is_connected());
        Err(DriverError::NoConnectionAvailable {
            address: self.address.to_string(),
        })
    }

    /// Count of connections currently alive.
    pub fn live_count(&self) -> usize {
        read_lock(&self.connections)
            .iter()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Open replacement connections until the pool is back at its configured
    /// size. Called from the HA monitor.
    pub async fn refill(&self) -> DriverResult<usize> {
        let deficit = {
            let mut connections = write_lock(&self.connections);
            connections.retain(|c| c.is_connected());
            self.size.saturating_sub(connections.len())
        };

        let mut added = 0;
        for _ in 0..deficit {
            match Connection::open(
                self.address.clone(),
                self.connect_timeout,
                self.max_message_size,
                self.events.clone(),
            )
            .await
            {
                Ok(conn) => {
                    write_lock(&self.connections).push(conn);
                    added += 1;
                }
                Err(e) => {
                    debug!("Refill connection to {} failed: {}", self.address, e);
                    break;
                }
            }
        }
        Ok(added)
    }

    /// Close every connection. `force` aborts in-flight writes; otherwise
    /// write sides are flushed first.
    pub async fn stop(&self, force: bool) {
        let connections = {
            let mut slot = write_lock(&self.connections);
            std::mem::take(&mut *slot)
        };
        for conn in connections {
            if force {
                conn.close();
            } else {
                conn.shutdown().await;
            }
        }
        debug!("Pool for {} stopped", self.address);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("live", &self.live_count())
            .finish()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
