//! Transport layer: executes decorated requests over their chosen route.
//!
//! Every egress route gets its own reqwest `Client` with the route's proxy
//! baked in, built once at startup. Identity headers come from the decorated
//! request, never from client defaults, so consecutive attempts on the same
//! route can present different identities.

mod response;

pub use response::RawResponse;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Proxy, Response};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::pipeline::{DecoratedRequest, EgressPool, EgressRoute, DIRECT_ROUTE_ID};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes one attempt. Implementations must not retry on their own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &DecoratedRequest) -> Result<RawResponse, TransportError>;
}

fn extract_response_headers(response: &Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// reqwest-backed transport with one client per route.
pub struct HttpTransport {
    clients: HashMap<String, Client>,
    timeout: Duration,
}

impl HttpTransport {
    /// Build clients for every route in the pool, plus the direct fallback.
    ///
    /// # Errors
    /// Returns `TransportError::Setup` if a proxy cannot be configured.
    pub fn new(egress: &EgressPool, timeout: Duration) -> Result<Self, TransportError> {
        let mut clients = HashMap::new();
        clients.insert(DIRECT_ROUTE_ID.to_string(), Self::build_client(None, timeout)?);
        for route in egress.routes() {
            clients.insert(route.id().to_string(), Self::build_client(Some(route), timeout)?);
        }
        info!(
            "HTTP transport ready with {} client(s), timeout {:?}",
            clients.len(),
            timeout
        );
        Ok(Self { clients, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a reqwest Client routed through the given route's proxy.
    fn build_client(route: Option<&EgressRoute>, timeout: Duration) -> Result<Client, TransportError> {
        let mut builder = Client::builder().timeout(timeout).gzip(true).brotli(true);

        if let Some(endpoint) = route.and_then(|r| r.endpoint()) {
            let proxy = Proxy::all(endpoint.url().as_str()).map_err(|e| {
                TransportError::Setup(format!("Invalid proxy '{}': {}", endpoint.redacted(), e))
            })?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        builder
            .build()
            .map_err(|e| TransportError::Setup(format!("Failed to create HTTP client: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &DecoratedRequest) -> Result<RawResponse, TransportError> {
        let client = self.clients.get(request.route.id()).ok_or_else(|| {
            TransportError::Setup(format!("no client for route {}", request.route.id()))
        })?;

        let mut builder = client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                TransportError::Setup(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = extract_response_headers(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(format!("failed to read body: {}", e)))?
            .to_vec();

        debug!(
            "GET {} via {} -> {} ({} bytes, {:?})",
            request.url,
            request.route.id(),
            status,
            body.len(),
            started.elapsed()
        );
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
