/// Single TCP channel to a server process
///
/// Each connection owns a background read task that reassembles the inbound
/// byte stream into discrete wire frames and forwards them as typed events
/// on the channel supplied at construction. Events flow strictly upward;
/// the connection holds no reference to its pool or server.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::core::{ConnectionEvent, ServerAddress};
use crate::error::{DriverError, DriverResult};
use crate::wire::MessageFramer;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live channel to a server.
pub struct Connection {
    id: u64,
    address: ServerAddress,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    connected: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dial the server and start the framed read task.
    pub async fn open(
        address: ServerAddress,
        connect_timeout: Duration,
        max_message_size: usize,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> DriverResult<Arc<Self>> {
        let stream = match timeout(
            connect_timeout,
            TcpStream::connect((address.host().to_string(), address.port())),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(DriverError::Network(e)),
            Err(_) => {
                return Err(DriverError::timeout(format!("connect to {address}")));
            }
        };

        // Low-latency request/response traffic; never batch small writes.
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let connected = Arc::new(AtomicBool::new(true));

        let connection = Arc::new(Self {
            id,
            address: address.clone(),
            writer: tokio::sync::Mutex::new(write_half),
            connected: Arc::clone(&connected),
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(
            read_half,
            MessageFramer::new(max_message_size),
            address,
            id,
            connected,
            events,
        ));
        *lock(&connection.reader_task) = Some(task);

        debug!("Opened connection {} to {}", id, connection.address);
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Write one already-framed message. Messages written on the same
    /// connection reach the server in write order.
    pub async fn write(&self, bytes: &[u8]) -> DriverResult<()> {
        if !self.is_connected() {
            return Err(DriverError::ConnectionClosed {
                address: self.address.to_string(),
            });
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        trace!("Wrote {} bytes to {}", bytes.len(), self.address);
        Ok(())
    }

    /// Tear the connection down immediately, abandoning in-flight writes.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }

    /// Flush and close the write side, then tear down the read task.
    pub async fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read task: frame inbound bytes, forward one event per frame, and report
/// the terminal condition. A parse error is fatal; the framer state cannot
/// be trusted after corruption, so the loop stops without local retry.
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut framer: MessageFramer,
    address: ServerAddress,
    connection_id: u64,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                connected.store(false, Ordering::Release);
                let _ = events.send(ConnectionEvent::Closed {
                    address,
                    connection_id,
                });
                return;
            }
            Ok(n) => match framer.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        let _ = events.send(ConnectionEvent::Message {
                            address: address.clone(),
                            connection_id,
                            frame,
                        });
                    }
                }
                Err(e) => {
                    connected.store(false, Ordering::Release);
                    let _ = events.send(ConnectionEvent::ParseError {
                        address,
                        connection_id,
                        message: e.to_string(),
                    });
                    return;
                }
            },
            Err(e) => {
                connected.store(false, Ordering::Release);
                let _ = events.send(ConnectionEvent::Error {
                    address,
                    connection_id,
                    message: e.to_string(),
                });
                return;
            }
        }
    }
}
