//! Best-effort readiness probing of the backend
//!
//! Probing never fails startup. An exhausted attempt budget is reported as
//! [`ProbeOutcome::NotReachable`] and the caller carries on.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Result of a probing run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered with a 2xx status
    Reachable { attempts: u32, elapsed: Duration },
    /// Every attempt failed
    NotReachable { attempts: u32, elapsed: Duration },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProbeOutcome::Reachable { attempts, .. } | ProbeOutcome::NotReachable { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Polls a URL with bounded, sequential GET requests
pub struct ReadinessProber {
    client: Client<HttpConnector, Empty<Bytes>>,
    request_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(request_timeout));

        // Each probe is a fresh connection so a half-started backend is not masked by a pooled socket
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            request_timeout,
        }
    }

    /// Probe `url` up to `max_attempts` times, sleeping `interval` after each failure
    pub async fn probe(&self, url: &Uri, max_attempts: u32, interval: Duration) -> ProbeOutcome {
        let start = Instant::now();

        for attempt in 1..=max_attempts {
            if self.check(url).await {
                info!(%url, attempt, elapsed_ms = start.elapsed().as_millis(), "Backend is reachable");
                return ProbeOutcome::Reachable {
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }

            debug!(%url, attempt, max_attempts, "Backend not reachable yet");

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        ProbeOutcome::NotReachable {
            attempts: max_attempts,
            elapsed: start.elapsed(),
        }
    }

    /// A single bounded GET; any 2xx counts as reachable
    async fn check(&self, url: &Uri) -> bool {
        let req = match Request::builder()
            .method("GET")
            .uri(url.clone())
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if !status.is_success() {
                    debug!(%url, %status, "Readiness check returned non-success status");
                }
                status.is_success()
            }
            Ok(Err(e)) => {
                debug!(%url, error = %e, "Readiness check failed");
                false
            }
            Err(_) => {
                debug!(%url, timeout_ms = self.request_timeout.as_millis(), "Readiness check timed out");
                false
            }
        }
    }
}
