/// One known server: its pool, last handshake-derived state and latency
/// statistics.
///
/// Eligibility is enforced here, at checkout time, so a role change between
/// selection and dispatch is caught: selection picks a candidate from the
/// topology snapshot, but the checkout re-checks the server's current role.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::connection::Connection;
use crate::core::pool::ConnectionPool;
use crate::core::{ConnectionEvent, HandshakeReply, ServerAddress, ServerRole, TagSet};
use crate::error::{DriverResult, SelectionError};
use crate::select::ReadMode;

#[derive(Debug, Default)]
struct ServerState {
    role: ServerRole,
    tags: TagSet,
    /// Canonical address the server reports for itself
    me: Option<String>,
    max_bson_object_size: Option<i32>,
    max_message_size_bytes: Option<i32>,
}

/// Running latency statistics for one server.
///
/// Ping round-trips and operation latencies feed separate figures: the ping
/// figure is the latest probe round-trip, the operation figure is an online
/// mean/variance over everything dispatched to the server.
#[derive(Debug, Default)]
struct LatencyStats {
    last_ping_ms: Option<f64>,
    count: u64,
    mean: f64,
    m2: f64,
}

impl LatencyStats {
    fn record_operation(&mut self, ms: f64) {
        self.count += 1;
        let delta = ms - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (ms - self.mean);
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

pub struct Server {
    address: ServerAddress,
    /// Standalone deployments read and write on the one server regardless
    /// of role gating.
    direct: bool,
    pool: ConnectionPool,
    state: RwLock<ServerState>,
    latency: Mutex<LatencyStats>,
    connected: AtomicBool,
}

impl Server {
    pub fn new(
        address: ServerAddress,
        direct: bool,
        pool_size: usize,
        connect_timeout: Duration,
        max_message_size: usize,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(
            address.clone(),
            pool_size,
            connect_timeout,
            max_message_size,
            events,
        );
        Arc::new(Self {
            address,
            direct,
            pool,
            state: RwLock::new(ServerState::default()),
            latency: Mutex::new(LatencyStats::default()),
            connected: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub async fn start(&self) -> DriverResult<()> {
        self.pool.start().await?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn stop(&self, force: bool) {
        self.connected.store(false, Ordering::Release);
        self.pool.stop(force).await;
    }

    /// Reopen dead pool connections; marks the server connected again when
    /// at least one connection is live.
    pub async fn refill(&self) -> DriverResult<usize> {
        let added = self.pool.refill().await?;
        if self.pool.live_count() > 0 {
            self.connected.store(true, Ordering::Release);
        }
        Ok(added)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.pool.live_count() > 0
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn role(&self) -> ServerRole {
        read_lock(&self.state).role
    }

    pub fn tags(&self) -> TagSet {
        read_lock(&self.state).tags.clone()
    }

    /// Canonical name the server reports for itself, falling back to the
    /// dialed address.
    pub fn canonical_name(&self) -> String {
        read_lock(&self.state)
            .me
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }

    /// Fold a fresh handshake reply into the server state.
    pub fn apply_handshake(&self, reply: &HandshakeReply) {
        let role = reply.role();
        let mut state = write_lock(&self.state);
        if state.role != role {
            debug!("Server {} role {} -> {}", self.address, state.role, role);
        }
        state.role = role;
        state.tags = reply.tags.clone();
        if reply.me.is_some() {
            state.me = reply.me.clone();
        }
        if reply.max_bson_object_size.is_some() {
            state.max_bson_object_size = reply.max_bson_object_size;
        }
        if reply.max_message_size_bytes.is_some() {
            state.max_message_size_bytes = reply.max_message_size_bytes;
        }
    }

    /// Server-advertised size limits, `(max document, max message)`.
    pub fn size_limits(&self) -> (Option<i32>, Option<i32>) {
        let state = read_lock(&self.state);
        (state.max_bson_object_size, state.max_message_size_bytes)
    }

    /// Force the role down to unknown, keeping tags; used when the primary
    /// is observed dead before a fresh handshake arrives.
    pub fn demote(&self) {
        write_lock(&self.state).role = ServerRole::Unknown;
    }

    /// Checkout for a write. Only the primary takes writes, unless this is a
    /// direct standalone connection.
    pub fn checkout_writer(&self) -> DriverResult<Arc<Connection>> {
        if !self.direct {
            let role = self.role();
            if role != ServerRole::Primary {
                return Err(SelectionError::NotWritable {
                    address: self.address.to_string(),
                    role: role.to_string(),
                }
                .into());
            }
        }
        self.pool.checkout()
    }

    /// Checkout for a read under the given mode. Role gating happens here
    /// so the decision uses the server's current role, not the snapshot the
    /// selection ran against.
    pub fn checkout_reader(&self, mode: ReadMode) -> DriverResult<Arc<Connection>> {
        if !self.direct {
            self.check_read_eligibility(mode)?;
        }
        self.pool.checkout()
    }

    /// Checkout with no role gating; the handshake and probe paths must be
    /// able to talk to a server whose role is not yet known.
    pub fn checkout_any(&self) -> DriverResult<Arc<Connection>> {
        self.pool.checkout()
    }

    pub fn check_read_eligibility(&self, mode: ReadMode) -> Result<(), SelectionError> {
        let role = self.role();
        if role == ServerRole::Arbiter {
            return Err(SelectionError::Arbiter {
                address: self.address.to_string(),
            });
        }
        match mode {
            ReadMode::Primary => {
                if role != ServerRole::Primary {
                    return Err(SelectionError::NotPrimary {
                        address: self.address.to_string(),
                    });
                }
            }
            ReadMode::Secondary => {
                if role == ServerRole::Primary {
                    return Err(SelectionError::PrimaryExcluded {
                        address: self.address.to_string(),
                    });
                }
                if role != ServerRole::Secondary {
                    return Err(SelectionError::NoEligibleServer {
                        preference: mode.to_string(),
                    });
                }
            }
            ReadMode::PrimaryPreferred | ReadMode::SecondaryPreferred | ReadMode::Nearest => {
                if !role.is_readable() {
                    return Err(SelectionError::NoEligibleServer {
                        preference: mode.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn record_operation_latency(&self, elapsed: Duration) {
        lock(&self.latency).record_operation(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_ping(&self, elapsed: Duration) {
        lock(&self.latency).last_ping_ms = Some(elapsed.as_secs_f64() * 1000.0);
    }

    /// Latest probe round-trip in milliseconds; None until the first probe
    /// completes.
    pub fn ping_latency_ms(&self) -> Option<f64> {
        lock(&self.latency).last_ping_ms
    }

    /// Running mean of operation latencies in milliseconds; None before any
    /// operation completed.
    pub fn mean_latency_ms(&self) -> Option<f64> {
        let stats = lock(&self.latency);
        if stats.count == 0 {
            None
        } else {
            Some(stats.mean)
        }
    }

    pub fn latency_variance(&self) -> f64 {
        lock(&self.latency).variance()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("role", &self.role())
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(direct: bool) -> Arc<Server> {
        let (events, _rx) = mpsc::unbounded_channel();
        std::mem::forget(_rx);
        Server::new(
            ServerAddress::new("127.0.0.1", 27017),
            direct,
            1,
            Duration::from_secs(1),
            1024,
            events,
        )
    }

    fn handshake(value: serde_json::Value) -> HandshakeReply {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_handshake_updates_role_and_tags() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({
            "secondary": true,
            "tags": {"dc": "east"},
            "me": "node-a:27017",
            "maxBsonObjectSize": 16_777_216,
            "maxMessageSizeBytes": 48_000_000,
        })));
        assert_eq!(server.role(), ServerRole::Secondary);
        assert_eq!(server.tags().get("dc").map(String::as_str), Some("east"));
        assert_eq!(server.canonical_name(), "node-a:27017");
        assert_eq!(server.size_limits(), (Some(16_777_216), Some(48_000_000)));
    }

    #[test]
    fn test_demote_resets_role() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({"ismaster": true})));
        assert_eq!(server.role(), ServerRole::Primary);
        server.demote();
        assert_eq!(server.role(), ServerRole::Unknown);
    }

    #[test]
    fn test_primary_mode_requires_primary_role() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({"secondary": true})));
        assert!(matches!(
            server.check_read_eligibility(ReadMode::Primary),
            Err(SelectionError::NotPrimary { .. })
        ));

        server.apply_handshake(&handshake(json!({"ismaster": true})));
        assert!(server.check_read_eligibility(ReadMode::Primary).is_ok());
    }

    #[test]
    fn test_secondary_mode_excludes_primary() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({"ismaster": true})));
        assert!(matches!(
            server.check_read_eligibility(ReadMode::Secondary),
            Err(SelectionError::PrimaryExcluded { .. })
        ));
    }

    #[test]
    fn test_arbiter_never_serves_reads() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({"arbiterOnly": true})));
        for mode in [
            ReadMode::Primary,
            ReadMode::PrimaryPreferred,
            ReadMode::Secondary,
            ReadMode::SecondaryPreferred,
            ReadMode::Nearest,
        ] {
            assert!(matches!(
                server.check_read_eligibility(mode),
                Err(SelectionError::Arbiter { .. })
            ));
        }
    }

    #[test]
    fn test_passive_is_not_readable() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({"secondary": true, "passive": true})));
        assert!(server.check_read_eligibility(ReadMode::Nearest).is_err());
        assert!(server
            .check_read_eligibility(ReadMode::SecondaryPreferred)
            .is_err());
    }

    #[test]
    fn test_preferred_modes_accept_either_data_role() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({"secondary": true})));
        assert!(server
            .check_read_eligibility(ReadMode::SecondaryPreferred)
            .is_ok());
        assert!(server
            .check_read_eligibility(ReadMode::PrimaryPreferred)
            .is_ok());
        assert!(server.check_read_eligibility(ReadMode::Nearest).is_ok());
    }

    #[test]
    fn test_writer_gating() {
        let server = server(false);
        server.apply_handshake(&handshake(json!({"secondary": true})));
        assert!(server.checkout_writer().is_err());
    }

    #[test]
    fn test_latency_statistics_welford() {
        let server = server(false);
        for ms in [10.0_f64, 20.0, 30.0] {
            server.record_operation_latency(Duration::from_secs_f64(ms / 1000.0));
        }
        let mean = server.mean_latency_ms().unwrap();
        assert!((mean - 20.0).abs() < 1e-6);
        assert!((server.latency_variance() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_ping_latency_starts_unmeasured() {
        let server = server(false);
        assert!(server.ping_latency_ms().is_none());
        server.record_ping(Duration::from_millis(4));
        assert!(server.ping_latency_ms().unwrap() >= 3.9);
    }
}
