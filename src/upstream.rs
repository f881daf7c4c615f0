//! Pooled HTTP client forwarding authenticated requests to the backend
//!
//! Request and response bodies are handed through as streams; nothing here
//! collects a body into memory.

use crate::body::{IdleTimeoutBody, ProgressBody};
use crate::error::GatewayBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single transport hop and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for upstream operations
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),

    #[error("no response within {0:?} after the request was sent")]
    Timeout(Duration),

    #[error("request body made no progress for {0:?}")]
    BodyStalled(Duration),
}

impl UpstreamError {
    /// Whether the backend could not be reached at all
    pub fn is_connect(&self) -> bool {
        matches!(self, UpstreamError::Client(e) if e.is_connect())
    }

    /// Whether the exchange was abandoned on a deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_) | UpstreamError::BodyStalled(_))
    }
}

/// Statistics for the upstream client
#[derive(Debug, Default)]
pub struct UpstreamStats {
    /// Requests handed to the backend
    pub forwarded: AtomicU64,
    /// Requests that produced no backend response
    pub failed: AtomicU64,
}

impl UpstreamStats {
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Backend base URL, e.g. `http://127.0.0.1:5000`
    pub base_url: String,
    /// Maximum idle connections kept to the backend
    pub max_idle: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Wait for the response head once the request body is fully sent
    pub response_timeout: Duration,
    /// Longest pause allowed between body frames in either direction
    pub body_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            max_idle: 8,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(300),
            body_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Pooled client for the single backend
pub struct UpstreamClient {
    client: Client<HttpConnector, ProgressBody<Incoming>>,
    base_url: String,
    stats: Arc<UpstreamStats>,
    response_timeout: Duration,
    body_idle_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        // The client never retries on its own; a request reaches the backend at most once
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle)
            .pool_idle_timeout(config.idle_timeout)
            .retry_canceled_requests(false)
            .build(connector);

        debug!(
            base_url = %config.base_url,
            max_idle = config.max_idle,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            stats: Arc::new(UpstreamStats::default()),
            response_timeout: config.response_timeout,
            body_idle_timeout: config.body_idle_timeout,
        }
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Build the backend URI for an inbound request target
    pub fn backend_uri(&self, uri: &Uri) -> Result<Uri, UpstreamError> {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.base_url, path)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| UpstreamError::RequestBuild(e.to_string()))
    }

    /// Forward a request to the backend and return its response with a streaming body.
    ///
    /// While the request body is still uploading only an idle pause of
    /// `body_idle_timeout` aborts the exchange. The `response_timeout`
    /// deadline starts once the last request frame has been handed over.
    pub async fn forward(&self, req: Request<Incoming>) -> Result<Response<GatewayBody>, UpstreamError> {
        let uri = self.backend_uri(req.uri())?;

        let (parts, body) = req.into_parts();
        let (body, mut progress) = ProgressBody::new(body);
        let mut builder = Request::builder().method(parts.method).uri(uri);

        if let Some(headers) = builder.headers_mut() {
            *headers = parts.headers;
            strip_hop_by_hop(headers);
            // Regenerated by the client from the backend URI
            headers.remove(hyper::header::HOST);
            // Credentials stop at the gateway
            headers.remove(hyper::header::AUTHORIZATION);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        self.stats.record_forwarded();

        let response = self.client.request(backend_req);
        tokio::pin!(response);

        // Upload phase
        loop {
            if progress.borrow_and_update().finished {
                break;
            }
            tokio::select! {
                result = &mut response => return Ok(self.relay(result?)),
                changed = tokio::time::timeout(self.body_idle_timeout, progress.changed()) => match changed {
                    Ok(Ok(())) => {}
                    // body dropped by the connection, nothing left to send
                    Ok(Err(_)) => break,
                    Err(_) => return Err(UpstreamError::BodyStalled(self.body_idle_timeout)),
                },
            }
        }

        let response = tokio::time::timeout(self.response_timeout, response)
            .await
            .map_err(|_| UpstreamError::Timeout(self.response_timeout))??;

        Ok(self.relay(response))
    }

    fn relay(&self, response: Response<Incoming>) -> Response<GatewayBody> {
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let body = IdleTimeoutBody::new(body, self.body_idle_timeout).boxed();
        Response::from_parts(parts, body)
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
