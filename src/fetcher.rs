//! Outbound fetch API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};
use url::Url;

use crate::config::Settings;
use crate::dispatch::{CancelToken, Dispatcher};
use crate::error::{ConfigError, FailureReason, TerminalFailure};
use crate::http_client::{HttpTransport, Transport};
use crate::pipeline::{Expect, Payload, Pipeline, RouteStats};

/// Per-fetch options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub expect: Expect,
    /// Sticky-session key; defaults to the URL's host.
    pub session_key: Option<String>,
    /// Overrides the configured attempt budget.
    pub max_attempts: Option<u32>,
}

impl FetchOptions {
    pub fn any() -> Self {
        Self {
            expect: Expect::Any,
            ..Self::default()
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Fetches URLs through the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Fetcher {
    dispatcher: Arc<Dispatcher>,
}

impl Fetcher {
    /// Build the pipeline and a reqwest transport from settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let pipeline = Pipeline::from_settings(settings)?;
        let transport = HttpTransport::new(pipeline.egress(), pipeline.request_timeout())
            .map_err(|e| ConfigError::Transport(e.to_string()))?;
        Ok(Self::with_transport(pipeline, Arc::new(transport)))
    }

    /// Use a custom transport.
    pub fn with_transport(pipeline: Pipeline, transport: Arc<dyn Transport>) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(Arc::new(pipeline), transport)),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.dispatcher.pipeline()
    }

    pub fn route_stats(&self) -> Vec<RouteStats> {
        self.pipeline().egress().stats()
    }

    /// Fetch one URL. Returns the accepted payload or a terminal failure;
    /// never panics on behalf of the request.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<Payload, TerminalFailure> {
        self.fetch_cancellable(url, options, CancelToken::never()).await
    }

    pub async fn fetch_cancellable(
        &self,
        url: &str,
        options: &FetchOptions,
        cancel: CancelToken,
    ) -> Result<Payload, TerminalFailure> {
        let parsed = match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
            Ok(parsed) => {
                return Err(TerminalFailure::new(url, FailureReason::ConfigError, 0)
                    .with_detail(format!("unsupported URL scheme '{}'", parsed.scheme())))
            }
            Err(e) => {
                return Err(TerminalFailure::new(url, FailureReason::ConfigError, 0)
                    .with_detail(format!("invalid URL: {}", e)))
            }
        };
        let session_key = options
            .session_key
            .clone()
            .or_else(|| parsed.host_str().map(str::to_string))
            .unwrap_or_default();

        let state = self
            .pipeline()
            .begin(url, &session_key, options.expect, options.max_attempts);
        let attempts = Arc::new(AtomicU32::new(0));

        let dispatcher = self.dispatcher.clone();
        let task_attempts = attempts.clone();
        let handle =
            tokio::spawn(async move { dispatcher.run(state, cancel, task_attempts).await });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                let detail = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "request task was aborted".to_string()
                };
                error!("Request for {} died: {}", url, detail);
                Err(TerminalFailure::new(
                    url,
                    FailureReason::Internal,
                    attempts.load(Ordering::Relaxed),
                )
                .with_detail(detail))
            }
        }
    }

    /// Fetch many URLs under the concurrency bound. Results are in input order.
    pub async fn fetch_all<S: AsRef<str>>(
        &self,
        urls: &[S],
        options: &FetchOptions,
    ) -> Vec<Result<Payload, TerminalFailure>> {
        self.fetch_all_cancellable(urls, options, CancelToken::never())
            .await
    }

    pub async fn fetch_all_cancellable<S: AsRef<str>>(
        &self,
        urls: &[S],
        options: &FetchOptions,
        cancel: CancelToken,
    ) -> Vec<Result<Payload, TerminalFailure>> {
        info!("Fetching {} URL(s)", urls.len());
        join_all(
            urls.iter()
                .map(|url| self.fetch_cancellable(url.as_ref(), options, cancel.clone())),
        )
        .await
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with non-string payload".to_string()
    }
}
