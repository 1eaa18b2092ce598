/// Background monitoring tasks
///
/// The HA loop keeps the member map honest: each tick it probes one server,
/// folds the reply back into the topology and repairs whatever the probe
/// exposes. The ping loop only runs when the configured latency strategy
/// needs round-trip figures; its probes double as handshake refreshes, so a
/// role change seen by the pinger reaches the topology without waiting for
/// the next HA tick.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::core::server::Server;
use crate::core::HandshakeReply;
use crate::error::DriverResult;
use crate::topology::replset::ReplicaSetTopology;

/// Handshake probe of one member. The topology implements this over its own
/// pooled connections; the seam exists so monitoring logic can be driven by
/// an alternate probe source.
#[async_trait]
pub trait MemberProbe: Send + Sync {
    async fn probe(&self, server: &Arc<Server>) -> DriverResult<HandshakeReply>;
}

/// Drive the HA monitor until the topology closes.
pub(crate) async fn run_ha(topology: Arc<ReplicaSetTopology>, interval: Duration) {
    debug!("HA monitor running every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if topology.is_closed() {
            return;
        }
        topology.ha_tick().await;
    }
}

/// Drive the latency probes until the topology closes.
pub(crate) async fn run_pings(topology: Arc<ReplicaSetTopology>, interval: Duration) {
    debug!("Latency probes running every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if topology.is_closed() {
            return;
        }
        topology.ping_tick().await;
    }
}
