//! Route selection strategies for the egress pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Result of a selection: the chosen index, and how long the route is held
/// for the session if the strategy pins routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub hold_until: Option<Instant>,
}

impl Selection {
    fn unpinned(index: usize) -> Self {
        Self {
            index,
            hold_until: None,
        }
    }
}

/// Strategy for choosing which route carries a request.
pub trait RouteSelectionStrategy: Send + Sync {
    /// Select a route index for the given session.
    ///
    /// # Arguments
    /// * `session_key` - Logical session (usually the target host)
    /// * `count` - Number of routes in the pool, always > 0
    /// * `exclude` - Index that must not be returned when `count > 1`
    /// * `now` - Current time, used by time-windowed strategies
    fn select(
        &self,
        session_key: &str,
        count: usize,
        exclude: Option<usize>,
        now: Instant,
    ) -> Selection;
}

/// Uniform choice in `0..count`, skipping `exclude` when another option exists.
fn uniform_index(count: usize, exclude: Option<usize>) -> usize {
    match exclude {
        Some(skip) if count > 1 && skip < count => {
            let idx = rand::rng().random_range(0..count - 1);
            if idx >= skip {
                idx + 1
            } else {
                idx
            }
        }
        _ => rand::rng().random_range(0..count),
    }
}

/// Random selection - independent uniform choice each call.
pub struct RandomStrategy;

impl RouteSelectionStrategy for RandomStrategy {
    fn select(&self, _key: &str, count: usize, exclude: Option<usize>, _now: Instant) -> Selection {
        Selection::unpinned(uniform_index(count, exclude))
    }
}

/// Sequential selection - round-robins through routes in fixed order.
pub struct SequentialStrategy {
    position: AtomicUsize,
}

impl SequentialStrategy {
    pub fn new() -> Self {
        Self {
            position: AtomicUsize::new(0),
        }
    }
}

impl Default for SequentialStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteSelectionStrategy for SequentialStrategy {
    fn select(&self, _key: &str, count: usize, exclude: Option<usize>, _now: Instant) -> Selection {
        let idx = self.position.fetch_add(1, Ordering::Relaxed) % count;
        if count > 1 && Some(idx) == exclude {
            // Concurrent callers interleaved; advance once more so the request rotates.
            let next = self.position.fetch_add(1, Ordering::Relaxed) % count;
            let next = if next == idx { (idx + 1) % count } else { next };
            return Selection::unpinned(next);
        }
        Selection::unpinned(idx)
    }
}

/// Hold used when `now + window` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Session count below which expired entries are left in place.
const MIN_PRUNE_AT: usize = 64;

#[derive(Debug, Clone, Copy)]
struct StickySession {
    index: usize,
    expires_at: Instant,
}

#[derive(Debug)]
struct SessionTable {
    sessions: HashMap<String, StickySession>,
    prune_at: usize,
}

impl SessionTable {
    /// Drop expired sessions once the table doubles in size since the last sweep.
    fn prune(&mut self, now: Instant) {
        if self.sessions.len() < self.prune_at {
            return;
        }
        let before = self.sessions.len();
        self.sessions.retain(|_, s| now < s.expires_at);
        self.prune_at = (self.sessions.len() * 2).max(MIN_PRUNE_AT);
        debug!(
            "Pruned {} expired sticky session(s), {} live",
            before - self.sessions.len(),
            self.sessions.len()
        );
    }
}

/// Sticky selection - pins each session key to one route for a fixed window.
pub struct StickyStrategy {
    window: Duration,
    table: Mutex<SessionTable>,
}

impl StickyStrategy {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            table: Mutex::new(SessionTable {
                sessions: HashMap::new(),
                prune_at: MIN_PRUNE_AT,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn expiry_from(&self, now: Instant) -> Instant {
        now.checked_add(self.window)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }
}

impl RouteSelectionStrategy for StickyStrategy {
    fn select(
        &self,
        session_key: &str,
        count: usize,
        exclude: Option<usize>,
        now: Instant,
    ) -> Selection {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(session) = table.sessions.get(session_key) {
            let excluded = count > 1 && Some(session.index) == exclude;
            if now < session.expires_at && session.index < count && !excluded {
                return Selection {
                    index: session.index,
                    hold_until: Some(session.expires_at),
                };
            }
        }

        let index = uniform_index(count, exclude);
        let expires_at = self.expiry_from(now);
        debug!(
            "Sticky session '{}' bound to route #{} for {:?}",
            session_key, index, self.window
        );
        table
            .sessions
            .insert(session_key.to_string(), StickySession { index, expires_at });
        table.prune(now);

        Selection {
            index,
            hold_until: Some(expires_at),
        }
    }
}

/// Selection policy as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicyType {
    #[default]
    Random,
    Sticky,
    Sequential,
}

impl SelectionPolicyType {
    /// Parse from string (for CLI/env var).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "random" => Some(Self::Random),
            "sticky" => Some(Self::Sticky),
            "sequential" | "round-robin" | "roundrobin" => Some(Self::Sequential),
            _ => None,
        }
    }
}

impl std::fmt::Display for SelectionPolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::Sticky => write!(f, "sticky"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Runtime selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    Random,
    Sticky(Duration),
    Sequential,
}

impl SelectionPolicy {
    pub fn from_type(policy: SelectionPolicyType, sticky_window: Duration) -> Self {
        match policy {
            SelectionPolicyType::Random => Self::Random,
            SelectionPolicyType::Sticky => Self::Sticky(sticky_window),
            SelectionPolicyType::Sequential => Self::Sequential,
        }
    }

    /// Create a strategy instance for this policy.
    pub fn create_strategy(&self) -> Box<dyn RouteSelectionStrategy> {
        match self {
            Self::Random => Box::new(RandomStrategy),
            Self::Sticky(window) => Box::new(StickyStrategy::new(*window)),
            Self::Sequential => Box::new(SequentialStrategy::new()),
        }
    }
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::Sticky(window) => write!(f, "sticky({:?})", window),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}
