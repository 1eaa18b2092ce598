/// Read-preference parsing and server selection
///
/// Selection runs against a snapshot of the topology: the caller passes the
/// current primary and the connected secondaries, and gets back one server
/// honoring the preference mode, the ordered tag-set filters and, when
/// configured, the latency strategy.
pub mod strategy;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::server::Server;
use crate::core::TagSet;
use crate::error::SelectionError;
use crate::select::strategy::LatencyStrategy;

/// Read-preference mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadMode {
    #[default]
    #[serde(rename = "primary")]
    Primary,
    #[serde(rename = "primaryPreferred")]
    PrimaryPreferred,
    #[serde(rename = "secondary")]
    Secondary,
    #[serde(rename = "secondaryPreferred")]
    SecondaryPreferred,
    #[serde(rename = "nearest")]
    Nearest,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        };
        write!(f, "{name}")
    }
}

/// A complete read preference: a mode plus ordered tag-set filters.
///
/// Tag sets are tried in order and the first one matching at least one
/// candidate wins; later sets are never consulted once an earlier one
/// matched. An empty list means no tag filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,
    #[serde(default)]
    pub tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    pub fn secondary_preferred() -> Self {
        Self::new(ReadMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    /// Older callers carry a plain boolean instead of a mode: true means
    /// "reads may go to a secondary". It maps onto secondary-preferred so a
    /// set with no readable secondary still answers from the primary.
    pub fn from_secondary_ok(secondary_ok: bool) -> Self {
        if secondary_ok {
            Self::new(ReadMode::SecondaryPreferred)
        } else {
            Self::new(ReadMode::Primary)
        }
    }

    /// Tag filters only make sense when the preference can consider more
    /// than the one primary.
    pub fn validate(&self) -> Result<(), SelectionError> {
        if self.mode == ReadMode::Primary && !self.tag_sets.is_empty() {
            return Err(SelectionError::TagsWithPrimary);
        }
        Ok(())
    }
}

impl From<ReadMode> for ReadPreference {
    fn from(mode: ReadMode) -> Self {
        Self::new(mode)
    }
}

/// Whether a server's tags satisfy one filter: every key/value pair of the
/// filter must be present verbatim. An empty filter matches every server.
pub fn tags_match(server_tags: &TagSet, filter: &TagSet) -> bool {
    filter
        .iter()
        .all(|(k, v)| server_tags.get(k).map(|sv| sv == v).unwrap_or(false))
}

/// Apply ordered tag-set filters: the first set matching at least one
/// candidate defines the result. No sets means no filtering.
fn filter_by_tags(candidates: &[Arc<Server>], tag_sets: &[TagSet]) -> Vec<Arc<Server>> {
    if tag_sets.is_empty() {
        return candidates.to_vec();
    }
    for tag_set in tag_sets {
        let matched: Vec<Arc<Server>> = candidates
            .iter()
            .filter(|s| tags_match(&s.tags(), tag_set))
            .cloned()
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

/// Narrow a candidate list to one server: the latency strategy when one is
/// configured, plain rotation otherwise.
fn pick(
    candidates: Vec<Arc<Server>>,
    strategy: Option<&dyn LatencyStrategy>,
    cursor: &AtomicUsize,
) -> Option<Arc<Server>> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        Some(strategy) => strategy.select(&candidates),
        None => {
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            Some(Arc::clone(&candidates[idx]))
        }
    }
}

/// Select the server a read should go to.
///
/// `primary` and `secondaries` are the connected data-bearing members of the
/// current topology snapshot; arbiters and passives never appear here.
pub fn select_reader(
    primary: Option<&Arc<Server>>,
    secondaries: &[Arc<Server>],
    preference: &ReadPreference,
    strategy: Option<&dyn LatencyStrategy>,
    cursor: &AtomicUsize,
) -> Result<Arc<Server>, SelectionError> {
    preference.validate()?;

    match preference.mode {
        ReadMode::Primary => primary.cloned().ok_or(SelectionError::NoPrimary),
        ReadMode::PrimaryPreferred => {
            if let Some(primary) = primary {
                return Ok(Arc::clone(primary));
            }
            let candidates = filter_by_tags(secondaries, &preference.tag_sets);
            pick(candidates, strategy, cursor).ok_or(SelectionError::NoPrimary)
        }
        ReadMode::Secondary => {
            let candidates = filter_by_tags(secondaries, &preference.tag_sets);
            pick(candidates, strategy, cursor).ok_or_else(|| {
                if secondaries.is_empty() {
                    SelectionError::NoSecondary
                } else {
                    SelectionError::NoEligibleServer {
                        preference: preference.mode.to_string(),
                    }
                }
            })
        }
        ReadMode::SecondaryPreferred => {
            let candidates = filter_by_tags(secondaries, &preference.tag_sets);
            if let Some(server) = pick(candidates, strategy, cursor) {
                return Ok(server);
            }
            // No matching secondary; the primary answers even when the tag
            // filters would exclude it.
            primary.cloned().ok_or(SelectionError::NoEligibleServer {
                preference: preference.mode.to_string(),
            })
        }
        ReadMode::Nearest => {
            let strategy = strategy.ok_or(SelectionError::NoLatencyStrategy)?;
            let mut pool: Vec<Arc<Server>> = Vec::with_capacity(secondaries.len() + 1);
            if let Some(primary) = primary {
                pool.push(Arc::clone(primary));
            }
            pool.extend_from_slice(secondaries);
            let candidates = filter_by_tags(&pool, &preference.tag_sets);
            strategy
                .select(&candidates)
                .ok_or(SelectionError::NoEligibleServer {
                    preference: preference.mode.to_string(),
                })
        }
    }
}
