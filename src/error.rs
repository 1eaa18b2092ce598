/// Unified error handling for the veleta client core
///
/// Transport, protocol and topology failures all funnel into [`DriverError`]
/// so callers have a single place to check for failure. Request-level errors
/// reported by the server inside a reply document are not errors at this
/// layer; they are decoded and handed back as ordinary documents.
use std::io;
use thiserror::Error;

/// Main error type for client core operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Network-related errors (connect, read, write)
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Wire-protocol framing and header errors; fatal to the connection
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Document encode/decode errors from the pluggable codec
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Topology discovery and monitoring errors
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Server selection errors (read preference could not be satisfied)
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// The connection carrying a request went away before the reply arrived
    #[error("Connection to {address} closed")]
    ConnectionClosed { address: String },

    /// Pool checkout found no open connection; never a queued wait
    #[error("No connection available to {address}")]
    NoConnectionAvailable { address: String },

    /// Per-request or connect timer expired
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// The pending-operation buffer overflowed; all buffered operations fail
    #[error("Pending operation buffer limit of {limit} exceeded")]
    PendingLimitExceeded { limit: usize },

    /// The topology has been shut down
    #[error("Client has been closed")]
    Closed,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Topology discovery and monitoring errors
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A member reported a replica-set name other than the configured one.
    /// Two different replica sets are never silently merged.
    #[error("Replica set name mismatch: expected '{expected}', server reported '{actual}'")]
    SetNameMismatch { expected: String, actual: String },

    /// Every candidate was exhausted without finding a primary or secondary
    #[error("Replica set discovery failed: {message}")]
    DiscoveryFailed { message: String },

    /// An operation needed a usable topology before discovery finished
    #[error("Topology is not ready")]
    NotReady,
}

/// Server selection errors
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("No primary server available")]
    NoPrimary,

    #[error("No secondary server available")]
    NoSecondary,

    #[error("No server matches read preference {preference}")]
    NoEligibleServer { preference: String },

    /// Tag sets cannot be combined with mode `primary`
    #[error("Tag sets are not allowed with read preference primary")]
    TagsWithPrimary,

    /// `nearest` needs a configured latency strategy to rank servers
    #[error("Read preference nearest requires a latency strategy")]
    NoLatencyStrategy,

    #[error("Server {address} is not the primary")]
    NotPrimary { address: String },

    /// An explicit secondary-only read must not silently use the primary
    #[error("Server {address} is the primary and the read preference excludes it")]
    PrimaryExcluded { address: String },

    /// Arbiters never serve data
    #[error("Server {address} is an arbiter and cannot serve reads or writes")]
    Arbiter { address: String },

    #[error("Server {address} ({role}) cannot accept writes")]
    NotWritable { address: String, role: String },
}

/// Result type alias for client core operations
pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        DriverError::Protocol {
            message: message.into(),
        }
    }

    /// Create a codec error
    pub fn codec<S: Into<String>>(message: S) -> Self {
        DriverError::Codec {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        DriverError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        DriverError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by waiting for the HA monitor
    /// to restore the topology (as opposed to a caller/configuration bug)
    pub fn is_recoverable(&self) -> bool {
        match self {
            DriverError::Network(_) => true,
            DriverError::ConnectionClosed { .. } => true,
            DriverError::NoConnectionAvailable { .. } => true,
            DriverError::Timeout { .. } => true,
            DriverError::Selection(SelectionError::NoPrimary) => true,
            DriverError::Selection(SelectionError::NoSecondary) => true,
            _ => false,
        }
    }
}
