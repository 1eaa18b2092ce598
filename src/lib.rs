//! veleta is an embeddable replica-set client core.
//!
//! The crate covers the hard part of a database driver: connection pooling,
//! wire framing with request/response correlation, replica-set discovery and
//! failover, and read-preference server selection. Everything above it
//! (query building, cursors, authentication) and the binary document codec
//! are external collaborators behind the [`codec::DocumentCodec`] trait.
//!
//! ```no_run
//! use std::sync::Arc;
//! use veleta::{ClientConfig, JsonCodec, ReadPreference, ReplicaSetClient};
//!
//! # async fn run() -> veleta::DriverResult<()> {
//! let client = ReplicaSetClient::connect(ClientConfig::default(), Arc::new(JsonCodec)).await?;
//! let reply = client
//!     .read_command(&serde_json::json!({"count": "users"}), &ReadPreference::secondary_preferred())
//!     .await?;
//! println!("{reply}");
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod select;
pub mod topology;
pub mod wire;

use std::sync::Arc;

use tokio::sync::broadcast;

pub use codec::{Document, DocumentCodec, JsonCodec};
pub use config::{ClientConfig, DeploymentConfig, MonitorConfig, OperationConfig, PoolConfig};
pub use crate::core::connection::Connection;
pub use crate::core::registry::OperationReply;
pub use crate::core::{ServerAddress, ServerRole, TagSet};
pub use error::{DriverError, DriverResult, SelectionError, TopologyError};
pub use select::strategy::StrategyKind;
pub use select::{ReadMode, ReadPreference};
pub use topology::replset::ReplicaSetTopology;
pub use topology::TopologyEvent;

/// Handle to one deployment: a replica set or a standalone server.
///
/// Cheap to clone; all clones share the topology, and closing any of them
/// closes all of them.
#[derive(Clone)]
pub struct ReplicaSetClient {
    topology: Arc<ReplicaSetTopology>,
}

impl std::fmt::Debug for ReplicaSetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSetClient").finish_non_exhaustive()
    }
}

impl ReplicaSetClient {
    /// Connect to the configured deployment. Returns once the topology can
    /// serve operations.
    pub async fn connect(
        config: ClientConfig,
        codec: Arc<dyn DocumentCodec>,
    ) -> DriverResult<Self> {
        let topology = ReplicaSetTopology::connect(config, codec).await?;
        Ok(Self { topology })
    }

    /// Connect without waiting for discovery to finish. Operations issued
    /// before the topology is ready buffer in the pending queue and run,
    /// writes first, once it is; they fail when setup fails.
    pub fn connect_lazy(config: ClientConfig, codec: Arc<dyn DocumentCodec>) -> DriverResult<Self> {
        let topology = ReplicaSetTopology::connect_lazy(config, codec)?;
        Ok(Self { topology })
    }

    /// Checkout a connection eligible for writes (the primary).
    pub async fn checkout_writer(&self) -> DriverResult<Arc<Connection>> {
        self.topology.checkout_writer().await
    }

    /// Checkout a connection eligible for reads under the preference.
    pub async fn checkout_reader(
        &self,
        preference: &ReadPreference,
    ) -> DriverResult<Arc<Connection>> {
        self.topology.checkout_reader(preference).await
    }

    /// Fresh request id for use with [`Self::send_and_await`].
    pub fn next_request_id(&self) -> i32 {
        self.topology.next_request_id()
    }

    /// The configured preference for reads that do not carry their own.
    pub fn default_read_preference(&self) -> ReadPreference {
        self.topology.default_read_preference()
    }

    /// Send pre-encoded payload bytes on a checked-out connection and await
    /// the correlated reply.
    pub async fn send_and_await(
        &self,
        conn: &Connection,
        payload: &[u8],
        request_id: i32,
    ) -> DriverResult<OperationReply> {
        self.topology.send_and_await(conn, payload, request_id).await
    }

    /// Encode, send and decode one command document on a checked-out
    /// connection.
    pub async fn send_command(
        &self,
        conn: &Connection,
        document: &Document,
    ) -> DriverResult<Document> {
        self.topology.send_command_on(conn, document).await
    }

    /// Send several documents back to back as one chained group; only the
    /// final reply surfaces.
    pub async fn send_chained(
        &self,
        conn: &Connection,
        documents: &[Document],
    ) -> DriverResult<Document> {
        self.topology.send_chained(conn, documents).await
    }

    /// Convenience: checkout the primary and run one command on it.
    pub async fn write_command(&self, document: &Document) -> DriverResult<Document> {
        let conn = self.topology.checkout_writer().await?;
        self.topology.send_command_on(&conn, document).await
    }

    /// Convenience: select a reader per the preference and run one command
    /// on it.
    pub async fn read_command(
        &self,
        document: &Document,
        preference: &ReadPreference,
    ) -> DriverResult<Document> {
        let conn = self.topology.checkout_reader(preference).await?;
        self.topology.send_command_on(&conn, document).await
    }

    /// Subscribe to topology lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }

    /// Direct access to the topology for callers that need more than the
    /// facade.
    pub fn topology(&self) -> &Arc<ReplicaSetTopology> {
        &self.topology
    }

    /// Shut everything down. Idempotent.
    pub async fn close(&self) {
        self.topology.close().await
    }
}
