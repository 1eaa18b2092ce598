/// Latency-based server selection strategies
///
/// A strategy narrows a list of role-eligible candidates down to one server
/// using latency figures the topology collects. Strategies hold their own
/// rotation state so repeated picks spread load across equally good servers.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::server::Server;

/// Which strategy the client runs; selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Periodic probe round-trips, lowest-latency fence, round-robin inside
    /// the fence
    #[serde(rename = "ping")]
    Ping,
    /// Online mean of observed operation latencies
    #[serde(rename = "statistics")]
    Statistics,
}

impl StrategyKind {
    pub fn build(&self, acceptable_latency: Duration) -> Box<dyn LatencyStrategy> {
        match self {
            StrategyKind::Ping => Box::new(PingStrategy::new(acceptable_latency)),
            StrategyKind::Statistics => Box::new(StatisticsStrategy::new(acceptable_latency)),
        }
    }
}

/// Picks one server out of a role-eligible candidate list.
pub trait LatencyStrategy: Send + Sync {
    fn select(&self, candidates: &[Arc<Server>]) -> Option<Arc<Server>>;

    /// Whether the strategy needs the periodic probe task running.
    fn needs_probes(&self) -> bool {
        false
    }
}

/// Probe-driven selection.
///
/// Only servers whose latest probe round-trip lies within the acceptable
/// fence above the fastest server stay in the running; the winner rotates
/// among the survivors. Servers that have never been probed are not
/// preferred over measured ones: they are skipped while at least one
/// measured candidate exists, and the probe task measures them shortly.
pub struct PingStrategy {
    acceptable_latency_ms: f64,
    cursor: AtomicUsize,
}

impl PingStrategy {
    pub fn new(acceptable_latency: Duration) -> Self {
        Self {
            acceptable_latency_ms: acceptable_latency.as_secs_f64() * 1000.0,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LatencyStrategy for PingStrategy {
    fn select(&self, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }

        let measured: Vec<(&Arc<Server>, f64)> = candidates
            .iter()
            .filter_map(|s| s.ping_latency_ms().map(|ms| (s, ms)))
            .collect();

        if measured.is_empty() {
            // Nothing probed yet; plain rotation until figures exist.
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            return Some(Arc::clone(&candidates[idx]));
        }

        let fastest = measured
            .iter()
            .map(|(_, ms)| *ms)
            .fold(f64::INFINITY, f64::min);
        let fence = fastest + self.acceptable_latency_ms;
        let survivors: Vec<&Arc<Server>> = measured
            .iter()
            .filter(|(_, ms)| *ms <= fence)
            .map(|(s, _)| *s)
            .collect();

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % survivors.len();
        Some(Arc::clone(survivors[idx]))
    }

    fn needs_probes(&self) -> bool {
        true
    }
}

/// Operation-statistics selection.
///
/// Ranks servers by the running mean of real operation latencies and applies
/// the same fence rule as the ping strategy: only servers whose mean lies
/// within the acceptable distance of the lowest mean stay in the running,
/// and the winner rotates among them. A server with no recorded operations
/// counts as a zero mean, which steers traffic toward it until real figures
/// accumulate.
pub struct StatisticsStrategy {
    acceptable_latency_ms: f64,
    cursor: AtomicUsize,
}

impl StatisticsStrategy {
    pub fn new(acceptable_latency: Duration) -> Self {
        Self {
            acceptable_latency_ms: acceptable_latency.as_secs_f64() * 1000.0,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LatencyStrategy for StatisticsStrategy {
    fn select(&self, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }

        let lowest = candidates
            .iter()
            .map(|s| s.mean_latency_ms().unwrap_or(0.0))
            .fold(f64::INFINITY, f64::min);
        let fence = lowest + self.acceptable_latency_ms;

        let survivors: Vec<&Arc<Server>> = candidates
            .iter()
            .filter(|s| s.mean_latency_ms().unwrap_or(0.0) <= fence)
            .collect();
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % survivors.len();
        Some(Arc::clone(survivors[idx]))
    }
}
