/// Replica-set topology: discovery, state, monitoring and dispatch
pub mod monitor;
pub mod pending;
pub mod replset;
pub mod state;

use crate::core::ServerAddress;

/// Lifecycle events broadcast to subscribers.
///
/// Events are advisory: a subscriber that lags and misses one observes the
/// same topology through the normal operation APIs. Every event carries the
/// affected address where one exists.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// A member came up during initial discovery
    Open { address: ServerAddress },
    /// The primary and every discovered member are connected
    FullSetup,
    /// A member joined the set after discovery
    Joined { address: ServerAddress },
    /// A member was removed from the set
    Left { address: ServerAddress },
    /// The topology has been shut down
    Close,
    /// A member failed
    Error {
        address: ServerAddress,
        message: String,
    },
    /// A request against a member timed out
    Timeout { address: ServerAddress },
    /// A member produced a corrupt inbound stream
    ParseError { address: ServerAddress },
}
