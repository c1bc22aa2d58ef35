//! Request pacing and retry backoff.
//!
//! Delays are returned as data. The dispatch loop schedules them on its own
//! timer; nothing in here ever sleeps.

use std::time::Duration;

use rand::Rng;
use tracing::trace;

use super::egress::EgressRoute;
use crate::error::ConfigError;

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Bounds for the randomized per-dispatch delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    min_delay: Duration,
    max_delay: Duration,
}

impl PacingConfig {
    /// # Errors
    /// Returns `ConfigError::InvalidDelayBounds` if `min_delay > max_delay`.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Result<Self, ConfigError> {
        if min_delay > max_delay {
            return Err(ConfigError::InvalidDelayBounds {
                min_ms: min_delay.as_millis() as u64,
                max_ms: max_delay.as_millis() as u64,
            });
        }
        Ok(Self {
            min_delay,
            max_delay,
        })
    }

    /// No pacing at all.
    pub fn none() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Exponential backoff applied on top of the pacing delay for retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    multiplier: f64,
    ceiling: Duration,
}

impl BackoffConfig {
    /// # Errors
    /// Returns `ConfigError::InvalidBackoffMultiplier` unless `multiplier` is finite and >= 1.
    pub fn new(multiplier: f64, ceiling: Duration) -> Result<Self, ConfigError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(multiplier));
        }
        Ok(Self {
            multiplier,
            ceiling,
        })
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            ceiling: DEFAULT_BACKOFF_CEILING,
        }
    }
}

/// Computes dispatch delays. Stateless; safe to share across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacingController;

impl PacingController {
    pub fn new() -> Self {
        Self
    }

    /// Uniform random delay in `[min_delay, max_delay]` for the next dispatch
    /// through `route`.
    pub fn delay_for(&self, route: &EgressRoute, config: &PacingConfig) -> Duration {
        let min_ms = config.min_delay.as_millis() as u64;
        let max_ms = config.max_delay.as_millis() as u64;
        let delay = if min_ms >= max_ms {
            config.min_delay
        } else {
            Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
        };
        trace!("Pacing delay for route {}: {:?}", route.id(), delay);
        delay
    }

    /// Delay before retry number `retry` (1 for the first retry):
    /// `base * multiplier^retry`, capped at the ceiling.
    pub fn backoff_for(&self, base: Duration, retry: u32, config: &BackoffConfig) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let scaled = base.as_secs_f64() * config.multiplier.powi(exponent);
        let ceiling = config.ceiling.as_secs_f64();
        if !scaled.is_finite() || scaled >= ceiling {
            config.ceiling
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}
