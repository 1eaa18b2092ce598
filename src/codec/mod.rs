/// Document codec boundary
///
/// The binary document codec is an external collaborator: the core only needs
/// to turn a command document into payload bytes before wrapping it in a wire
/// header, and to turn reply payload bytes back into a document before handing
/// them to the caller. Everything else (cursors, CRUD, auth payloads) lives
/// above this crate.
use crate::error::{DriverError, DriverResult};

/// Document type exchanged across the codec boundary.
pub type Document = serde_json::Value;

/// Encoder/decoder for documents crossing the wire boundary.
///
/// Implementations must be cheap to call concurrently; the topology shares
/// one codec instance across the handshake path, the HA monitor and every
/// caller-issued command.
pub trait DocumentCodec: Send + Sync {
    fn encode(&self, document: &Document) -> DriverResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> DriverResult<Document>;
}

/// JSON codec used by the in-crate handshake path and the test suite.
///
/// Production deployments plug in their binary codec; the core never looks
/// inside the payload bytes apart from handing them to the codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn encode(&self, document: &Document) -> DriverResult<Vec<u8>> {
        serde_json::to_vec(document).map_err(|e| DriverError::codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> DriverResult<Document> {
        serde_json::from_slice(bytes).map_err(|e| DriverError::codec(e.to_string()))
    }
}
