//! Error types for configuration, transport, and terminal request failures.
//!
//! Classified response outcomes are not errors: they are values of
//! [`Outcome`](crate::pipeline::Outcome) consumed by the retry coordinator.
//! Only the final, reportable result of a request surfaces as a
//! [`TerminalFailure`].

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::pipeline::Outcome;

/// Fatal configuration problems, detected at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("identity pool is empty: at least one identity profile is required")]
    EmptyIdentityPool,
    #[error("invalid delay bounds: min_delay ({min_ms}ms) exceeds max_delay ({max_ms}ms)")]
    InvalidDelayBounds { min_ms: u64, max_ms: u64 },
    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("retry.backoff_multiplier must be a finite number >= 1.0 (got {0})")]
    InvalidBackoffMultiplier(f64),
    #[error("retry.backoff_ceiling_ms ({ceiling_ms}ms) is below pacing.min_delay_ms ({min_ms}ms)")]
    CeilingBelowMinDelay { ceiling_ms: u64, min_ms: u64 },
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("invalid egress route '{address}': {reason}")]
    InvalidRoute { address: String, reason: String },
    #[error("invalid selection policy '{0}'. Valid options: random, sticky, sequential")]
    UnknownPolicy(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("failed to build HTTP transport: {0}")]
    Transport(String),
}

/// Errors raised by a transport while executing one attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection refused, timeout, or a failure reading the body.
    /// Recoverable: becomes `Outcome::NetworkError` and drives a retry.
    #[error("network error: {0}")]
    Network(String),
    /// The transport could not be prepared for the chosen route.
    /// Unexpected: the request terminates with `FailureReason::ConfigError`.
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// Structured reason attached to every terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Blocked,
    RateLimited,
    ExhaustedRetries,
    ConfigError,
    Cancelled,
    Internal,
}

impl FailureReason {
    /// Reason reported when the attempt budget runs out, derived from the
    /// last classified outcome.
    pub fn for_exhaustion(last: &Outcome) -> Self {
        match last {
            Outcome::BlockedCaptcha { .. } | Outcome::BlockedUnknown { .. } => Self::Blocked,
            Outcome::RateLimited { .. } => Self::RateLimited,
            _ => Self::ExhaustedRetries,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
            Self::ExhaustedRetries => "exhausted_retries",
            Self::ConfigError => "config_error",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definitive failure for one URL, reported to the caller of `fetch`.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{url}: {reason} after {attempts} attempt(s)")]
pub struct TerminalFailure {
    pub url: String,
    pub reason: FailureReason,
    /// Outcome of the last attempt that completed, if any did.
    pub last_outcome: Option<Outcome>,
    pub attempts: u32,
    /// Free-form diagnostic for `config_error` and `internal` failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TerminalFailure {
    pub fn new(url: impl Into<String>, reason: FailureReason, attempts: u32) -> Self {
        Self {
            url: url.into(),
            reason,
            last_outcome: None,
            attempts,
            detail: None,
        }
    }

    pub fn with_outcome(mut self, outcome: Option<Outcome>) -> Self {
        self.last_outcome = outcome;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
