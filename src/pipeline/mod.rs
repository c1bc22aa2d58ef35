//! The request middleware pipeline.
//!
//! A dispatch loop drives each request through two hooks:
//!
//! - [`Pipeline::decorate`] attaches an identity, an egress route and a
//!   scheduled delay to the next attempt.
//! - [`Pipeline::on_response`] classifies what came back and answers with an
//!   [`Action`]: accept the payload, retry with a freshly decorated request,
//!   or fail with a [`TerminalFailure`].

pub mod classifier;
pub mod egress;
pub mod identity;
pub mod pacing;
pub mod retry;

pub use classifier::{
    BlockSignal, ClassificationRule, ClassifierConfig, Expect, Outcome, ResponseClassifier,
    ResponseView,
};
pub use egress::{
    EgressPool, EgressRoute, ProxyEndpoint, RouteStats, SelectionPolicy, SelectionPolicyType,
    DIRECT_ROUTE_ID,
};
pub use identity::{IdentityPool, IdentityProfile};
pub use pacing::{BackoffConfig, PacingConfig, PacingController};
pub use retry::{
    Action, DecoratedRequest, Payload, RequestAttempt, RequestState, RequestStatus,
    RetryCoordinator, RetryPolicy, TerminalStatus,
};

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::Settings;
use crate::error::{ConfigError, TerminalFailure, TransportError};
use crate::http_client::RawResponse;

pub const DEFAULT_CONCURRENCY: usize = 2;

/// Configured pipeline: shared pools, classifier and retry policy.
#[derive(Debug)]
pub struct Pipeline {
    coordinator: RetryCoordinator,
    concurrency: usize,
    request_timeout: Duration,
}

impl Pipeline {
    pub fn new(coordinator: RetryCoordinator, concurrency: usize, request_timeout: Duration) -> Self {
        Self {
            coordinator,
            concurrency: concurrency.max(1),
            request_timeout,
        }
    }

    /// Validate settings and build every component.
    ///
    /// # Errors
    /// Returns the first `ConfigError` found.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        settings.validate()?;

        let identities = settings.identity_pool()?;
        let egress = settings.egress_pool()?;
        let classifier = ResponseClassifier::new(&settings.classifier_config());
        let policy = settings.retry_policy()?;

        info!(
            "Pipeline ready: {} identities, {} route(s), max {} attempt(s), concurrency {}",
            identities.len(),
            egress.len(),
            policy.max_attempts,
            settings.concurrency
        );

        let coordinator = RetryCoordinator::new(
            Arc::new(identities),
            Arc::new(egress),
            settings.pacing_config()?,
            Arc::new(classifier),
            policy,
        );
        Ok(Self::new(
            coordinator,
            settings.concurrency,
            Duration::from_secs(settings.request_timeout_secs),
        ))
    }

    pub fn coordinator(&self) -> &RetryCoordinator {
        &self.coordinator
    }

    pub fn egress(&self) -> &EgressPool {
        self.coordinator.egress()
    }

    pub fn identities(&self) -> &IdentityPool {
        self.coordinator.identities()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Start tracking a request.
    pub fn begin(
        &self,
        url: &str,
        session_key: &str,
        expect: Expect,
        max_attempts: Option<u32>,
    ) -> RequestState {
        self.coordinator.begin(url, session_key, expect, max_attempts)
    }

    /// Request hook: decorate the first attempt.
    pub fn decorate(&self, state: &mut RequestState) -> Result<DecoratedRequest, TerminalFailure> {
        self.coordinator.prepare(state)
    }

    pub fn mark_dispatched(&self, state: &mut RequestState) {
        self.coordinator.mark_dispatched(state);
    }

    /// Response hook.
    pub fn on_response(&self, state: &mut RequestState, response: RawResponse) -> Action {
        self.coordinator.on_response(state, response)
    }

    pub fn on_transport_error(&self, state: &mut RequestState, error: TransportError) -> Action {
        self.coordinator.on_transport_error(state, error)
    }

    pub fn cancel(&self, state: &mut RequestState) -> TerminalFailure {
        self.coordinator.cancel(state)
    }
}
