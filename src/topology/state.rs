/// Membership bookkeeping for one replica set
///
/// Servers are keyed two ways: the `addresses` map by dialed address is the
/// single source of truth for which `Server` instances exist, and the role
/// maps key by the canonical name the server reports for itself. A canonical
/// name lives in at most one role map at a time, and the primary slot and
/// the secondary map never hold the same name.
///
/// The state itself is a plain data structure; the topology wraps it in an
/// async lock and is the only writer (HA and dispatch paths included).
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::core::server::Server;
use crate::core::{ServerAddress, ServerRole};
use crate::error::TopologyError;

#[derive(Default)]
pub struct ReplicaSetState {
    set_name: Option<String>,
    master: Option<Arc<Server>>,
    secondaries: HashMap<String, Arc<Server>>,
    arbiters: HashMap<String, Arc<Server>>,
    passives: HashMap<String, Arc<Server>>,
    addresses: HashMap<ServerAddress, Arc<Server>>,
    errors: HashMap<String, String>,
}

impl ReplicaSetState {
    pub fn new(set_name: Option<String>) -> Self {
        Self {
            set_name,
            ..Default::default()
        }
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// Check a member-reported set name against the established one, or
    /// adopt it when none is established yet. Two different sets are never
    /// silently merged.
    pub fn establish_set_name(&mut self, reported: &str) -> Result<(), TopologyError> {
        match &self.set_name {
            Some(expected) if expected != reported => Err(TopologyError::SetNameMismatch {
                expected: expected.clone(),
                actual: reported.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                info!("Adopting replica set name '{}'", reported);
                self.set_name = Some(reported.to_string());
                Ok(())
            }
        }
    }

    /// Register a server under its dialed address.
    pub fn insert(&mut self, server: Arc<Server>) {
        self.addresses.insert(server.address().clone(), server);
    }

    /// Place a server in the role map matching its current role. A primary
    /// displaces the previous one: the old master is demoted to unknown and
    /// stays in the address map for the HA monitor to reclassify.
    pub fn classify(&mut self, server: &Arc<Server>) {
        let name = server.canonical_name();
        self.secondaries.remove(&name);
        self.arbiters.remove(&name);
        self.passives.remove(&name);
        if self
            .master
            .as_ref()
            .map(|m| m.canonical_name() == name)
            .unwrap_or(false)
        {
            self.master = None;
        }

        match server.role() {
            ServerRole::Primary => {
                if let Some(old) = self.master.take() {
                    debug!(
                        "Primary moved from {} to {}",
                        old.canonical_name(),
                        name
                    );
                    old.demote();
                }
                self.master = Some(Arc::clone(server));
                self.errors.remove(&name);
            }
            ServerRole::Secondary => {
                self.secondaries.insert(name.clone(), Arc::clone(server));
                self.errors.remove(&name);
            }
            ServerRole::Arbiter => {
                self.arbiters.insert(name, Arc::clone(server));
            }
            ServerRole::Passive => {
                self.passives.insert(name, Arc::clone(server));
            }
            ServerRole::Unknown => {}
        }
    }

    /// Remove a member everywhere it is tracked. Returns the server so the
    /// caller can stop its pool outside the state lock.
    pub fn remove(&mut self, canonical_name: &str) -> Option<Arc<Server>> {
        self.secondaries.remove(canonical_name);
        self.arbiters.remove(canonical_name);
        self.passives.remove(canonical_name);
        self.errors.remove(canonical_name);
        if self
            .master
            .as_ref()
            .map(|m| m.canonical_name() == canonical_name)
            .unwrap_or(false)
        {
            self.master = None;
        }
        let address = self
            .addresses
            .iter()
            .find(|(_, s)| s.canonical_name() == canonical_name)
            .map(|(a, _)| a.clone())?;
        self.addresses.remove(&address)
    }

    /// React to a server losing its last connection: mark it down, drop it
    /// from the role maps, and clear the primary slot when it held it. The
    /// server stays in the address map so the HA monitor reconnects it.
    pub fn mark_down(&mut self, address: &ServerAddress, reason: &str) -> Option<Arc<Server>> {
        let server = self.addresses.get(address).cloned()?;
        server.mark_disconnected();
        server.demote();
        let name = server.canonical_name();
        self.secondaries.remove(&name);
        self.arbiters.remove(&name);
        self.passives.remove(&name);
        if self
            .master
            .as_ref()
            .map(|m| m.address() == address)
            .unwrap_or(false)
        {
            info!("Primary {} is down: {}", address, reason);
            self.master = None;
        }
        self.errors.insert(name, reason.to_string());
        Some(server)
    }

    pub fn record_error(&mut self, canonical_name: String, message: String) {
        self.errors.insert(canonical_name, message);
    }

    pub fn master(&self) -> Option<Arc<Server>> {
        self.master
            .as_ref()
            .filter(|m| m.is_connected())
            .cloned()
    }

    pub fn connected_secondaries(&self) -> Vec<Arc<Server>> {
        self.secondaries
            .values()
            .filter(|s| s.is_connected())
            .cloned()
            .collect()
    }

    pub fn server_at(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.addresses.get(address).cloned()
    }

    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.addresses.contains_key(address)
    }

    pub fn all_servers(&self) -> Vec<Arc<Server>> {
        self.addresses.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.addresses.len()
    }

    /// Canonical names of every tracked member.
    pub fn member_names(&self) -> Vec<String> {
        self.addresses.values().map(|s| s.canonical_name()).collect()
    }

    /// Whether operations can make progress at all: a primary or at least
    /// one readable secondary.
    pub fn is_usable(&self) -> bool {
        self.master().is_some() || !self.connected_secondaries().is_empty()
    }

    /// Whether the set is fully assembled: a primary plus every tracked
    /// member connected.
    pub fn is_full_setup(&self) -> bool {
        self.master().is_some() && self.addresses.values().all(|s| s.is_connected())
    }

    pub fn errors(&self) -> &HashMap<String, String> {
        &self.errors
    }
}

impl std::fmt::Debug for ReplicaSetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSetState")
            .field("set_name", &self.set_name)
            .field("master", &self.master.as_ref().map(|m| m.canonical_name()))
            .field("secondaries", &self.secondaries.keys().collect::<Vec<_>>())
            .field("arbiters", &self.arbiters.keys().collect::<Vec<_>>())
            .field("passives", &self.passives.keys().collect::<Vec<_>>())
            .field("members", &self.addresses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HandshakeReply;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn server(port: u16, handshake: serde_json::Value) -> Arc<Server> {
        let (events, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        let server = Server::new(
            ServerAddress::new("127.0.0.1", port),
            false,
            1,
            Duration::from_secs(1),
            1024,
            events,
        );
        let reply: HandshakeReply = serde_json::from_value(handshake).unwrap();
        server.apply_handshake(&reply);
        server
    }

    #[test]
    fn test_set_name_establish_and_mismatch() {
        let mut state = ReplicaSetState::new(None);
        state.establish_set_name("rs0").unwrap();
        assert_eq!(state.set_name(), Some("rs0"));
        assert!(state.establish_set_name("rs0").is_ok());
        assert!(matches!(
            state.establish_set_name("rs1"),
            Err(TopologyError::SetNameMismatch { .. })
        ));
    }

    #[test]
    fn test_configured_set_name_rejects_stranger() {
        let mut state = ReplicaSetState::new(Some("rs0".to_string()));
        assert!(matches!(
            state.establish_set_name("other"),
            Err(TopologyError::SetNameMismatch { .. })
        ));
    }

    #[test]
    fn test_classify_separates_roles() {
        let mut state = ReplicaSetState::new(Some("rs0".to_string()));
        let primary = server(1, json!({"ismaster": true, "me": "a:1"}));
        let secondary = server(2, json!({"secondary": true, "me": "b:2"}));
        let arbiter = server(3, json!({"arbiterOnly": true, "me": "c:3"}));

        for s in [&primary, &secondary, &arbiter] {
            state.insert(Arc::clone(s));
            state.classify(s);
        }

        // Servers never marked connected: master() filters on liveness.
        assert!(state.master().is_none());
        assert_eq!(state.member_count(), 3);
        assert!(state.connected_secondaries().is_empty());
    }

    #[test]
    fn test_role_change_moves_between_maps() {
        let mut state = ReplicaSetState::new(Some("rs0".to_string()));
        let node = server(1, json!({"secondary": true, "me": "a:1"}));
        state.insert(Arc::clone(&node));
        state.classify(&node);

        let promoted: HandshakeReply =
            serde_json::from_value(json!({"ismaster": true, "me": "a:1"})).unwrap();
        node.apply_handshake(&promoted);
        state.classify(&node);

        assert!(state.connected_secondaries().is_empty());
        assert_eq!(state.member_count(), 1);
    }

    #[test]
    fn test_new_primary_demotes_old_one() {
        let mut state = ReplicaSetState::new(Some("rs0".to_string()));
        let old = server(1, json!({"ismaster": true, "me": "a:1"}));
        let new = server(2, json!({"ismaster": true, "me": "b:2"}));
        state.insert(Arc::clone(&old));
        state.classify(&old);
        state.insert(Arc::clone(&new));
        state.classify(&new);

        assert_eq!(old.role(), ServerRole::Unknown);
        assert_eq!(new.role(), ServerRole::Primary);
    }

    #[test]
    fn test_remove_clears_every_map() {
        let mut state = ReplicaSetState::new(Some("rs0".to_string()));
        let node = server(1, json!({"secondary": true, "me": "a:1"}));
        state.insert(Arc::clone(&node));
        state.classify(&node);

        let removed = state.remove("a:1").unwrap();
        assert_eq!(removed.canonical_name(), "a:1");
        assert_eq!(state.member_count(), 0);
        assert!(state.remove("a:1").is_none());
    }

    #[test]
    fn test_mark_down_records_error_and_keeps_address() {
        let mut state = ReplicaSetState::new(Some("rs0".to_string()));
        let node = server(1, json!({"secondary": true, "me": "a:1"}));
        state.insert(Arc::clone(&node));
        state.classify(&node);

        state.mark_down(&ServerAddress::new("127.0.0.1", 1), "connection reset");
        assert_eq!(node.role(), ServerRole::Unknown);
        assert_eq!(state.member_count(), 1);
        assert_eq!(
            state.errors().get("a:1").map(String::as_str),
            Some("connection reset")
        );
    }
}
