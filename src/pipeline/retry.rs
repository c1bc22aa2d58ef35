//! Per-request attempt state and the retry state machine.
//!
//! ```text
//! Pending -> Dispatched -> Succeeded
//!                       -> Retrying -> Pending (new attempt, rotated identity + route)
//!                       -> Failed    (attempt budget spent, setup error, or cancelled)
//! ```
//!
//! Each `RequestState` is owned by exactly one request task, so none of it
//! is shared. The coordinator itself only holds the shared pools.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::classifier::{Expect, Outcome, ResponseClassifier};
use super::egress::{EgressPool, EgressRoute};
use super::identity::{IdentityPool, IdentityProfile};
use super::pacing::{BackoffConfig, PacingConfig, PacingController};
use crate::error::{FailureReason, TerminalFailure, TransportError};
use crate::http_client::RawResponse;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_ANY: &str = "*/*";

/// Retry budget and backoff behaviour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Wait at least as long as a 429's `Retry-After` (still capped at the ceiling).
    pub honor_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffConfig::default(),
            honor_retry_after: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Dispatched,
    Retrying,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed(FailureReason),
}

/// One try of a request.
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    pub request_id: Uuid,
    /// 1-based.
    pub attempt_number: u32,
    pub identity: Arc<IdentityProfile>,
    pub route: Arc<EgressRoute>,
    pub scheduled_delay: Duration,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Set once the dispatch completes; never before.
    pub outcome: Option<Outcome>,
}

/// All attempts for one URL.
#[derive(Debug)]
pub struct RequestState {
    request_id: Uuid,
    url: String,
    session_key: String,
    expect: Expect,
    attempts: Vec<RequestAttempt>,
    max_attempts: u32,
    status: RequestStatus,
    terminal_status: Option<TerminalStatus>,
}

impl RequestState {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn expect(&self) -> Expect {
        self.expect
    }

    pub fn attempts(&self) -> &[RequestAttempt] {
        &self.attempts
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        self.terminal_status
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status.is_some()
    }

    /// Outcome of the most recent completed attempt.
    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.attempts.iter().rev().find_map(|a| a.outcome.as_ref())
    }

    fn current_mut(&mut self) -> Option<&mut RequestAttempt> {
        self.attempts.last_mut()
    }
}

/// A request ready for the transport: headers attached, route chosen,
/// delay to wait before sending.
#[derive(Debug, Clone)]
pub struct DecoratedRequest {
    pub request_id: Uuid,
    pub url: String,
    pub attempt_number: u32,
    pub headers: Vec<(String, String)>,
    pub identity: Arc<IdentityProfile>,
    pub route: Arc<EgressRoute>,
    pub scheduled_delay: Duration,
}

/// Accepted response body and metadata.
#[derive(Debug, Clone)]
pub struct Payload {
    pub url: String,
    pub status: u16,
    pub headers: std::collections::HashMap<String, String>,
    pub body: Vec<u8>,
    pub attempts: u32,
    pub route_id: String,
}

impl Payload {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(|s| s.as_str())
    }
}

/// What the dispatch loop must do next.
#[derive(Debug)]
pub enum Action {
    Accept(Payload),
    Retry(DecoratedRequest),
    Fail(TerminalFailure),
}

/// Decides resubmit-vs-fail for every request, drawing identities and
/// routes from the shared pools.
#[derive(Debug)]
pub struct RetryCoordinator {
    identities: Arc<IdentityPool>,
    egress: Arc<EgressPool>,
    pacing: PacingController,
    pacing_config: PacingConfig,
    classifier: Arc<ResponseClassifier>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(
        identities: Arc<IdentityPool>,
        egress: Arc<EgressPool>,
        pacing_config: PacingConfig,
        classifier: Arc<ResponseClassifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            identities,
            egress,
            pacing: PacingController::new(),
            pacing_config,
            classifier,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn identities(&self) -> &IdentityPool {
        &self.identities
    }

    pub fn egress(&self) -> &EgressPool {
        &self.egress
    }

    pub fn classifier(&self) -> &ResponseClassifier {
        &self.classifier
    }

    /// Start tracking a request. `max_attempts` overrides the policy budget.
    pub fn begin(
        &self,
        url: impl Into<String>,
        session_key: impl Into<String>,
        expect: Expect,
        max_attempts: Option<u32>,
    ) -> RequestState {
        RequestState {
            request_id: Uuid::new_v4(),
            url: url.into(),
            session_key: session_key.into(),
            expect,
            attempts: Vec::new(),
            max_attempts: max_attempts.unwrap_or(self.policy.max_attempts),
            status: RequestStatus::Pending,
            terminal_status: None,
        }
    }

    /// Create the next attempt: pick identity and route (rotating away from
    /// the previous attempt's), compute the delay, and decorate the request.
    pub fn prepare(&self, state: &mut RequestState) -> Result<DecoratedRequest, TerminalFailure> {
        if state.is_terminal() {
            return Err(self.internal(state, "request already finished"));
        }
        if state.max_attempts == 0 {
            let failure = TerminalFailure::new(&state.url, FailureReason::ConfigError, 0)
                .with_detail("max_attempts must be at least 1");
            return Err(self.finish(state, failure));
        }
        if state.attempt_count() >= state.max_attempts {
            let reason = state
                .last_outcome()
                .map(FailureReason::for_exhaustion)
                .unwrap_or(FailureReason::ExhaustedRetries);
            let failure = TerminalFailure::new(&state.url, reason, state.attempt_count())
                .with_outcome(state.last_outcome().cloned());
            return Err(self.finish(state, failure));
        }

        let (identity, route, scheduled_delay) = match state.attempts.last() {
            None => {
                let identity = self.identities.pick();
                let route = self.egress.pick(&state.session_key);
                let delay = self.pacing.delay_for(&route, &self.pacing_config);
                (identity, route, delay)
            }
            Some(previous) => {
                let identity = self.identities.pick_other(&previous.identity);
                let route = self.egress.pick_other(&state.session_key, &previous.route);
                let delay = self.retry_delay(&route, state.attempt_count(), previous.outcome.as_ref());
                (identity, route, delay)
            }
        };

        let attempt_number = state.attempt_count() + 1;
        let mut headers = identity.headers();
        headers.push((
            "accept".to_string(),
            match state.expect {
                Expect::Html => ACCEPT_HTML,
                Expect::Any => ACCEPT_ANY,
            }
            .to_string(),
        ));

        debug!(
            "Request {} attempt {}/{} via {} in {:?}",
            state.request_id, attempt_number, state.max_attempts, route.id(), scheduled_delay
        );

        state.attempts.push(RequestAttempt {
            request_id: state.request_id,
            attempt_number,
            identity: identity.clone(),
            route: route.clone(),
            scheduled_delay,
            dispatched_at: None,
            outcome: None,
        });
        state.status = RequestStatus::Pending;

        Ok(DecoratedRequest {
            request_id: state.request_id,
            url: state.url.clone(),
            attempt_number,
            headers,
            identity,
            route,
            scheduled_delay,
        })
    }

    /// Backoff off a fresh pacing draw; `retry` is 1 for the first retry.
    fn retry_delay(&self, route: &EgressRoute, retry: u32, last: Option<&Outcome>) -> Duration {
        let base = self.pacing.delay_for(route, &self.pacing_config);
        let backoff = &self.policy.backoff;
        let mut delay = self.pacing.backoff_for(base, retry, backoff);
        if self.policy.honor_retry_after {
            if let Some(secs) = last.and_then(|o| o.retry_after_secs()) {
                delay = delay.max(Duration::from_secs(secs)).min(backoff.ceiling());
            }
        }
        delay
    }

    /// Record that the current attempt has left for the network.
    pub fn mark_dispatched(&self, state: &mut RequestState) {
        if state.is_terminal() {
            return;
        }
        if let Some(attempt) = state.current_mut() {
            attempt.dispatched_at = Some(Utc::now());
            attempt.route.mark_dispatched();
            state.status = RequestStatus::Dispatched;
        }
    }

    /// Classify a completed response and decide what happens next.
    pub fn on_response(&self, state: &mut RequestState, response: RawResponse) -> Action {
        let body_size = response.body.len() as u64;
        let outcome = self.classifier.classify(
            response.status,
            &response.headers,
            &response.body,
            body_size,
            state.expect,
        );

        if let Err(failure) = self.record(state, outcome.clone()) {
            return Action::Fail(failure);
        }

        if outcome.is_success() {
            let route_id = state
                .attempts
                .last()
                .map(|a| a.route.id().to_string())
                .unwrap_or_default();
            state.status = RequestStatus::Succeeded;
            state.terminal_status = Some(TerminalStatus::Succeeded);
            info!(
                "Fetched {} ({} bytes, status {}, {} attempt(s))",
                state.url,
                body_size,
                response.status,
                state.attempt_count()
            );
            return Action::Accept(Payload {
                url: state.url.clone(),
                status: response.status,
                headers: response.headers,
                body: response.body,
                attempts: state.attempt_count(),
                route_id,
            });
        }

        self.retry_or_fail(state)
    }

    /// Handle a transport error for the current attempt.
    pub fn on_transport_error(&self, state: &mut RequestState, error: TransportError) -> Action {
        match error {
            TransportError::Network(message) => {
                if let Err(failure) = self.record(state, Outcome::NetworkError { message }) {
                    return Action::Fail(failure);
                }
                self.retry_or_fail(state)
            }
            TransportError::Setup(message) => {
                warn!("Transport setup failed for {}: {}", state.url, message);
                let failure = TerminalFailure::new(
                    &state.url,
                    FailureReason::ConfigError,
                    state.attempt_count(),
                )
                .with_outcome(state.last_outcome().cloned())
                .with_detail(message);
                Action::Fail(self.finish(state, failure))
            }
        }
    }

    /// Stop the request. Any attempt still in flight keeps no outcome.
    pub fn cancel(&self, state: &mut RequestState) -> TerminalFailure {
        info!("Request {} for {} cancelled", state.request_id, state.url);
        let failure = TerminalFailure::new(&state.url, FailureReason::Cancelled, state.attempt_count())
            .with_outcome(state.last_outcome().cloned());
        self.finish(state, failure)
    }

    /// Attach an outcome to the current attempt. Only a dispatched attempt
    /// without an outcome can take one.
    fn record(&self, state: &mut RequestState, outcome: Outcome) -> Result<(), TerminalFailure> {
        let accepted = state.status == RequestStatus::Dispatched
            && state
                .current_mut()
                .map(|a| a.dispatched_at.is_some() && a.outcome.is_none())
                .unwrap_or(false);
        if !accepted {
            return Err(self.internal(state, "outcome arrived for an attempt that was not dispatched"));
        }

        if outcome.is_block() {
            if let Some(attempt) = state.attempts.last() {
                warn!(
                    "{} attempt {} via {}: {}",
                    state.url,
                    attempt.attempt_number,
                    attempt.route.id(),
                    outcome
                );
            }
        } else {
            debug!("{} attempt {}: {}", state.url, state.attempt_count(), outcome);
        }

        if let Some(attempt) = state.current_mut() {
            attempt.outcome = Some(outcome);
        }
        Ok(())
    }

    fn retry_or_fail(&self, state: &mut RequestState) -> Action {
        if state.attempt_count() >= state.max_attempts {
            let last = state.last_outcome().cloned();
            let reason = last
                .as_ref()
                .map(FailureReason::for_exhaustion)
                .unwrap_or(FailureReason::ExhaustedRetries);
            warn!(
                "Giving up on {} after {} attempt(s): {}",
                state.url,
                state.attempt_count(),
                reason
            );
            let failure = TerminalFailure::new(&state.url, reason, state.attempt_count()).with_outcome(last);
            return Action::Fail(self.finish(state, failure));
        }

        state.status = RequestStatus::Retrying;
        match self.prepare(state) {
            Ok(next) => Action::Retry(next),
            Err(failure) => Action::Fail(failure),
        }
    }

    fn internal(&self, state: &mut RequestState, message: &str) -> TerminalFailure {
        let failure = TerminalFailure::new(&state.url, FailureReason::Internal, state.attempt_count())
            .with_outcome(state.last_outcome().cloned())
            .with_detail(message);
        self.finish(state, failure)
    }

    fn finish(&self, state: &mut RequestState, failure: TerminalFailure) -> TerminalFailure {
        if state.terminal_status.is_none() {
            state.terminal_status = Some(TerminalStatus::Failed(failure.reason));
        }
        state.status = RequestStatus::Failed;
        failure
    }
}
