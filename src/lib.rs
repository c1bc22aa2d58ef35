//! stealthfetch - resilient fetching from sites that resist automated access.
//!
//! Requests pass through a middleware pipeline that rotates client
//! identities and egress routes, paces dispatch with scheduled (never
//! blocking) delays, classifies every response, and retries soft blocks
//! with exponential backoff until the attempt budget is spent.
//!
//! ```no_run
//! use stealthfetch::{FetchOptions, Fetcher, Settings};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = Settings::load(None).await?.with_env_overrides()?;
//! let fetcher = Fetcher::from_settings(&settings)?;
//! match fetcher.fetch("https://example.com/", &FetchOptions::default()).await {
//!     Ok(page) => println!("{} bytes after {} attempt(s)", page.body.len(), page.attempts),
//!     Err(failure) => eprintln!("{}", failure),
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetcher;
pub mod http_client;
pub mod pipeline;

pub use config::Settings;
pub use dispatch::{CancelHandle, CancelToken, Dispatcher};
pub use error::{ConfigError, FailureReason, TerminalFailure, TransportError};
pub use fetcher::{FetchOptions, Fetcher};
pub use http_client::{HttpTransport, RawResponse, Transport};
pub use pipeline::{Expect, Outcome, Payload, Pipeline};
