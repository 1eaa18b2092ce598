/// Core connection-layer abstractions: addresses, roles, handshake replies
/// and the typed events connections report upward.
pub mod connection;
pub mod pool;
pub mod registry;
pub mod server;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{DriverError, DriverResult};

/// Default server port when a seed or gossiped address omits one.
pub const DEFAULT_PORT: u16 = 27017;

/// Canonical `(host, port)` identity of a server process.
///
/// This is the deduplication key for every topology map: two `Server`
/// instances with the same address are never simultaneously live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string; a bare host gets the default port.
    pub fn parse(input: &str) -> DriverResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DriverError::internal("empty server address"));
        }
        match input.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(DriverError::internal(format!(
                        "invalid server address '{input}'"
                    )));
                }
                let port = port.parse::<u16>().map_err(|_| {
                    DriverError::internal(format!("invalid port in server address '{input}'"))
                })?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(input, DEFAULT_PORT)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Last-known role of a server, refreshed on every successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerRole {
    #[default]
    Unknown,
    Primary,
    Secondary,
    Arbiter,
    Passive,
}

impl ServerRole {
    /// Roles that can serve read operations
    pub fn is_readable(&self) -> bool {
        matches!(self, ServerRole::Primary | ServerRole::Secondary)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerRole::Unknown => "unknown",
            ServerRole::Primary => "primary",
            ServerRole::Secondary => "secondary",
            ServerRole::Arbiter => "arbiter",
            ServerRole::Passive => "passive",
        };
        write!(f, "{name}")
    }
}

/// Operator-assigned key/value metadata usable to target reads.
pub type TagSet = HashMap<String, String>;

/// Fields of the topology handshake reply the core consumes.
///
/// The handshake is the lightweight command exchanged on every new
/// connection and periodically thereafter; it reports the node's own role
/// plus its view of the member list, which drives gossip discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeReply {
    #[serde(default)]
    pub ismaster: bool,
    #[serde(default)]
    pub secondary: bool,
    #[serde(default, rename = "arbiterOnly")]
    pub arbiter_only: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default, rename = "setName")]
    pub set_name: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub passives: Vec<String>,
    #[serde(default)]
    pub arbiters: Vec<String>,
    /// `host:port` of the current primary as known to the responder
    #[serde(default)]
    pub primary: Option<String>,
    /// The responder's canonical address; may differ from the dialed one
    #[serde(default)]
    pub me: Option<String>,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default, rename = "maxBsonObjectSize")]
    pub max_bson_object_size: Option<i32>,
    #[serde(default, rename = "maxMessageSizeBytes")]
    pub max_message_size_bytes: Option<i32>,
}

impl HandshakeReply {
    /// Role this reply classifies the responder as.
    ///
    /// Arbiter wins over everything (arbiters never serve data); passive
    /// wins over plain secondary so priority-zero members stay out of the
    /// read rotation.
    pub fn role(&self) -> ServerRole {
        if self.arbiter_only {
            ServerRole::Arbiter
        } else if self.ismaster {
            ServerRole::Primary
        } else if self.passive {
            ServerRole::Passive
        } else if self.secondary {
            ServerRole::Secondary
        } else {
            ServerRole::Unknown
        }
    }

    /// All member addresses this reply reports, in hosts/passives/arbiters
    /// order.
    pub fn reported_members(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Events a connection reports to its owning topology, tagged with enough
/// identity for per-server error fan-out.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// One fully reassembled inbound frame
    Message {
        address: ServerAddress,
        connection_id: u64,
        frame: Bytes,
    },
    /// Socket-level failure; fatal to the connection
    Error {
        address: ServerAddress,
        connection_id: u64,
        message: String,
    },
    /// Corrupt inbound stream; fatal to the connection
    ParseError {
        address: ServerAddress,
        connection_id: u64,
        message: String,
    },
    /// Clean close (EOF) of the connection
    Closed {
        address: ServerAddress,
        connection_id: u64,
    },
}

impl ConnectionEvent {
    pub fn address(&self) -> &ServerAddress {
        match self {
            ConnectionEvent::Message { address, .. }
            | ConnectionEvent::Error { address, .. }
            | ConnectionEvent::ParseError { address, .. }
            | ConnectionEvent::Closed { address, .. } => address,
        }
    }
}
