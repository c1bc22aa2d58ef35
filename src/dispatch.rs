//! Cooperative dispatch loop.
//!
//! Each request runs as its own task. Scheduled delays are awaited on the
//! tokio timer without holding a concurrency permit, so a long pacing or
//! backoff wait never occupies a slot another request could use. Attempts
//! of one request are strictly sequential.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{FailureReason, TerminalFailure};
use crate::http_client::Transport;
use crate::pipeline::{Action, Payload, Pipeline, RequestState};

/// Caller side of a cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

/// Request side of a cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            token: self.token.child_token(),
        }
    }

    /// Stop every request holding a token from this handle.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Drives requests through the pipeline and a transport, with at most
/// `concurrency` attempts on the wire at once.
pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, transport: Arc<dyn Transport>) -> Self {
        let permits = Arc::new(Semaphore::new(
            pipeline.concurrency().min(Semaphore::MAX_PERMITS),
        ));
        Self {
            pipeline,
            transport,
            permits,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run a request to its terminal result. `attempts` mirrors the number
    /// of attempts made so far, for reporting if the task dies.
    pub async fn run(
        &self,
        mut state: RequestState,
        cancel: CancelToken,
        attempts: Arc<AtomicU32>,
    ) -> Result<Payload, TerminalFailure> {
        let mut request = self.pipeline.decorate(&mut state)?;

        loop {
            attempts.store(state.attempt_count(), Ordering::Relaxed);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.pipeline.cancel(&mut state)),
                _ = tokio::time::sleep(request.scheduled_delay) => {}
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.pipeline.cancel(&mut state)),
                permit = self.permits.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                let failure = TerminalFailure::new(state.url(), FailureReason::Internal, state.attempt_count())
                    .with_detail("dispatcher shut down");
                return Err(failure);
            };

            debug!(
                "Dispatching {} attempt {} via {}",
                request.url,
                request.attempt_number,
                request.route.id()
            );
            self.pipeline.mark_dispatched(&mut state);

            // An attempt still in flight when cancelled is dropped with no outcome.
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.transport.execute(&request) => Some(result),
            };
            drop(permit);

            let Some(result) = result else {
                return Err(self.pipeline.cancel(&mut state));
            };

            let action = match result {
                Ok(response) => self.pipeline.on_response(&mut state, response),
                Err(error) => self.pipeline.on_transport_error(&mut state, error),
            };
            match action {
                Action::Accept(payload) => return Ok(payload),
                Action::Retry(next) => request = next,
                Action::Fail(failure) => return Err(failure),
            }
        }
    }
}
