//! Egress routes (direct or proxied) and the pool that rotates them.
//!
//! Routes are created once from configuration and live for the whole
//! process. Each route carries its own usage bookkeeping in atomics, so
//! concurrent requests never serialize on a pool-wide lock to record a
//! dispatch. Route health is not tracked here: burned proxies must be
//! rotated out of the configuration by the operator.

mod selection;

pub use selection::{
    RandomStrategy, RouteSelectionStrategy, Selection, SelectionPolicy, SelectionPolicyType,
    SequentialStrategy, StickyStrategy,
};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ConfigError;

/// Identifier used for the direct-connection route.
pub const DIRECT_ROUTE_ID: &str = "direct";

const SUPPORTED_PROXY_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

/// Proxy endpoint of a non-direct route.
#[derive(Clone)]
pub struct ProxyEndpoint {
    /// Full proxy URL, including any credentials.
    url: Url,
}

impl ProxyEndpoint {
    /// Parse and validate a proxy URL.
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRoute {
            address: redact(address),
            reason: reason.to_string(),
        };

        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        if !SUPPORTED_PROXY_SCHEMES.contains(&url.scheme()) {
            return Err(invalid(&format!(
                "unsupported scheme '{}' (expected one of: {})",
                url.scheme(),
                SUPPORTED_PROXY_SCHEMES.join(", ")
            )));
        }
        if url.host_str().map_or(true, |h| h.is_empty()) {
            return Err(invalid("missing host"));
        }
        Ok(Self { url })
    }

    /// Proxy URL including credentials, for building the transport.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Username and password embedded in the proxy URL, if any.
    pub fn credentials(&self) -> Option<(&str, Option<&str>)> {
        if self.url.username().is_empty() {
            None
        } else {
            Some((self.url.username(), self.url.password()))
        }
    }

    /// Proxy URL with the password masked.
    pub fn redacted(&self) -> String {
        redact(self.url.as_str())
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("url", &self.redacted())
            .finish()
    }
}

/// Mask the password portion of a URL-ish string.
pub(crate) fn redact(address: &str) -> String {
    match Url::parse(address) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => address.to_string(),
    }
}

/// One egress route with its usage bookkeeping.
///
/// Timestamps are stored as milliseconds since the owning pool's epoch,
/// offset by one so that zero means "never".
pub struct EgressRoute {
    id: String,
    endpoint: Option<ProxyEndpoint>,
    epoch: Instant,
    last_used_ms: AtomicU64,
    in_use_until_ms: AtomicU64,
    dispatches: AtomicU64,
}

impl EgressRoute {
    fn new(id: String, endpoint: Option<ProxyEndpoint>, epoch: Instant) -> Self {
        Self {
            id,
            endpoint,
            epoch,
            last_used_ms: AtomicU64::new(0),
            in_use_until_ms: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        }
    }

    /// Direct-connection route.
    pub fn direct(epoch: Instant) -> Self {
        Self::new(DIRECT_ROUTE_ID.to_string(), None, epoch)
    }

    /// Parse a configured route address. `direct` is accepted as a literal.
    pub fn parse(id: impl Into<String>, address: &str, epoch: Instant) -> Result<Self, ConfigError> {
        let address = address.trim();
        if address.eq_ignore_ascii_case(DIRECT_ROUTE_ID) {
            return Ok(Self::new(id.into(), None, epoch));
        }
        Ok(Self::new(id.into(), Some(ProxyEndpoint::parse(address)?), epoch))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_direct(&self) -> bool {
        self.endpoint.is_none()
    }

    pub fn endpoint(&self) -> Option<&ProxyEndpoint> {
        self.endpoint.as_ref()
    }

    /// Printable address with credentials masked.
    pub fn address(&self) -> String {
        self.endpoint
            .as_ref()
            .map(|e| e.redacted())
            .unwrap_or_else(|| DIRECT_ROUTE_ID.to_string())
    }

    fn encode(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64 + 1
    }

    fn decode(&self, raw: u64) -> Option<Instant> {
        raw.checked_sub(1)
            .map(|ms| self.epoch + Duration::from_millis(ms))
    }

    /// Record a dispatch through this route.
    pub fn mark_dispatched(&self) {
        let now = self.encode(Instant::now());
        self.last_used_ms.fetch_max(now, Ordering::AcqRel);
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        self.decode(self.last_used_ms.load(Ordering::Acquire))
    }

    /// Extend the sticky hold on this route. Never moves the hold backwards.
    pub fn hold_until(&self, until: Instant) {
        let encoded = self.encode(until);
        self.in_use_until_ms.fetch_max(encoded, Ordering::AcqRel);
    }

    pub fn in_use_until(&self) -> Option<Instant> {
        self.decode(self.in_use_until_ms.load(Ordering::Acquire))
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for EgressRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EgressRoute")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("dispatches", &self.dispatches())
            .finish()
    }
}

/// Snapshot of a route's usage for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    pub id: String,
    pub address: String,
    pub dispatches: u64,
    /// Milliseconds since the route was last dispatched through.
    pub idle_ms: Option<u64>,
    /// Milliseconds remaining on a sticky hold.
    pub held_for_ms: Option<u64>,
}

/// Pool of egress routes with a selection policy.
pub struct EgressPool {
    routes: Vec<Arc<EgressRoute>>,
    direct: Arc<EgressRoute>,
    policy: SelectionPolicy,
    strategy: Box<dyn RouteSelectionStrategy>,
}

impl EgressPool {
    /// Build a pool from route addresses.
    ///
    /// An empty list is legal: every pick then yields the direct route.
    pub fn new(addresses: &[String], policy: SelectionPolicy) -> Result<Self, ConfigError> {
        let epoch = Instant::now();
        let routes = addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| EgressRoute::parse(format!("route-{}", i), addr, epoch).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        if routes.is_empty() {
            warn!("No egress routes configured; all requests use a direct connection");
        } else {
            info!(
                "Egress pool initialized with {} route(s) (policy: {})",
                routes.len(),
                policy
            );
            for route in &routes {
                debug!("  {} -> {}", route.id(), route.address());
            }
        }

        Ok(Self {
            routes,
            direct: Arc::new(EgressRoute::direct(epoch)),
            policy,
            strategy: policy.create_strategy(),
        })
    }

    /// Pool with no routes; every request goes direct.
    pub fn direct_only() -> Self {
        let epoch = Instant::now();
        Self {
            routes: Vec::new(),
            direct: Arc::new(EgressRoute::direct(epoch)),
            policy: SelectionPolicy::Random,
            strategy: SelectionPolicy::Random.create_strategy(),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn routes(&self) -> &[Arc<EgressRoute>] {
        &self.routes
    }

    /// Choose a route for a session according to the pool's policy.
    ///
    /// Returns the direct route when the pool is empty.
    pub fn pick(&self, session_key: &str) -> Arc<EgressRoute> {
        self.select(session_key, None)
    }

    /// Choose a route other than `previous` (when more than one exists).
    /// Used when rotating after a failed attempt.
    pub fn pick_other(&self, session_key: &str, previous: &EgressRoute) -> Arc<EgressRoute> {
        let exclude = self.routes.iter().position(|r| r.id() == previous.id());
        self.select(session_key, exclude)
    }

    fn select(&self, session_key: &str, exclude: Option<usize>) -> Arc<EgressRoute> {
        if self.routes.is_empty() {
            return self.direct.clone();
        }

        let selection = self
            .strategy
            .select(session_key, self.routes.len(), exclude, Instant::now());
        let route = self.routes[selection.index].clone();
        if let Some(until) = selection.hold_until {
            route.hold_until(until);
        }
        route
    }

    /// Usage snapshot for every configured route.
    pub fn stats(&self) -> Vec<RouteStats> {
        let now = Instant::now();
        self.routes
            .iter()
            .map(|r| RouteStats {
                id: r.id().to_string(),
                address: r.address(),
                dispatches: r.dispatches(),
                idle_ms: r
                    .last_used_at()
                    .map(|t| now.saturating_duration_since(t).as_millis() as u64),
                held_for_ms: r
                    .in_use_until()
                    .filter(|t| *t > now)
                    .map(|t| t.duration_since(now).as_millis() as u64),
            })
            .collect()
    }
}

impl fmt::Debug for EgressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EgressPool")
            .field("routes", &self.routes)
            .field("policy", &self.policy)
            .finish()
    }
}
