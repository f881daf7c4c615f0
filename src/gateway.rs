use crate::config::{Config, ConfigError};
use crate::credentials::CredentialStore;
use crate::error::{json_error_response, unauthorized_response, GatewayBody, GatewayErrorCode};
use crate::upstream::{UpstreamClient, UpstreamConfig};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Settings for the public listener
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub bind_addr: SocketAddr,
    /// Realm advertised in the Basic challenge
    pub realm: String,
    /// Keep forwarding headers set by the proxy in front of the gateway
    pub trust_forwarded: bool,
    /// Maximum concurrently served connections
    pub max_connections: usize,
    /// How long open connections may finish after shutdown is requested
    pub shutdown_grace: Duration,
    pub upstream: UpstreamConfig,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let gateway = &config.gateway;
        Ok(Self {
            bind_addr: gateway.socket_addr()?,
            realm: gateway.realm.clone(),
            trust_forwarded: gateway.trust_forwarded,
            max_connections: gateway.max_connections,
            shutdown_grace: gateway.shutdown_grace(),
            upstream: UpstreamConfig {
                base_url: config.backend.base_url(),
                max_idle: gateway.pool_max_idle,
                idle_timeout: gateway.pool_idle_timeout(),
                connect_timeout: gateway.connect_timeout(),
                response_timeout: gateway.upstream_timeout(),
                body_idle_timeout: gateway.body_idle_timeout(),
            },
        })
    }
}

/// Read-only state shared by every request handler
struct GatewayContext {
    credentials: CredentialStore,
    upstream: UpstreamClient,
    realm: String,
    trust_forwarded: bool,
}

/// The authenticating reverse proxy
pub struct Gateway {
    settings: GatewaySettings,
    context: Arc<GatewayContext>,
    shutdown_rx: watch::Receiver<bool>,
}

/// A gateway whose listener is already bound
pub struct BoundGateway {
    listener: TcpListener,
    local_addr: SocketAddr,
    gateway: Gateway,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        credentials: CredentialStore,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let context = Arc::new(GatewayContext {
            credentials,
            upstream: UpstreamClient::new(settings.upstream.clone()),
            realm: settings.realm.clone(),
            trust_forwarded: settings.trust_forwarded,
        });
        Self {
            settings,
            context,
            shutdown_rx,
        }
    }

    /// Bind the public listener without serving yet
    pub async fn bind(self) -> std::io::Result<BoundGateway> {
        let listener = TcpListener::bind(self.settings.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(BoundGateway {
            listener,
            local_addr,
            gateway: self,
        })
    }
}

impl BoundGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown, then drain in-flight connections
    pub async fn serve(self) -> anyhow::Result<()> {
        let BoundGateway {
            listener,
            local_addr,
            gateway,
        } = self;
        let Gateway {
            settings,
            context,
            mut shutdown_rx,
        } = gateway;

        info!(
            addr = %local_addr,
            backend = %settings.upstream.base_url,
            max_connections = settings.max_connections,
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let permits = Arc::new(Semaphore::new(settings.max_connections));
        let in_flight = Arc::new(AtomicUsize::new(0));
        // A dropped sender means shutdown can no longer be requested
        let mut signal_open = true;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown_rx.changed(), if signal_open => {
                    if changed.is_err() {
                        signal_open = false;
                        warn!("Shutdown signal channel closed, serving until the process exits");
                    }
                    continue;
                }
            };

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&context);
                            let conn_shutdown = shutdown_rx.clone();
                            let guard = InFlightGuard::new(Arc::clone(&in_flight));

                            tokio::spawn(async move {
                                let _permit = permit;
                                let _guard = guard;
                                if let Err(e) = handle_connection(stream, addr, context, conn_shutdown).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed(), if signal_open => {
                    if changed.is_err() {
                        signal_open = false;
                        warn!("Shutdown signal channel closed, serving until the process exits");
                    }
                }
            }
        }

        info!("Gateway stopped accepting connections");
        drop(listener);

        drain(&in_flight, settings.shutdown_grace).await;

        let stats = context.upstream.stats();
        info!(
            forwarded = stats.get_forwarded(),
            failed = stats.get_failed(),
            "Gateway shut down"
        );

        Ok(())
    }
}

/// Counts a live connection for the lifetime of the guard
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for in-flight connections to finish, bounded by the grace period
async fn drain(in_flight: &AtomicUsize, grace: Duration) {
    let drain_start = Instant::now();
    while in_flight.load(Ordering::SeqCst) > 0 {
        if drain_start.elapsed() > grace {
            let remaining = in_flight.load(Ordering::SeqCst);
            warn!(remaining, grace_secs = grace.as_secs(), "Drain timeout exceeded, exiting with open connections");
            return;
        }
        tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
    }
    let drained_in = drain_start.elapsed();
    if drained_in > Duration::from_millis(100) {
        info!(drained_in_ms = drained_in.as_millis(), "Drained in-flight connections");
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<GatewayContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let mut watching = !*shutdown_rx.borrow();
    if !watching {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
            }
            changed = shutdown_rx.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                } else if *shutdown_rx.borrow() {
                    // Finish the in-progress exchange, then close
                    watching = false;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<GatewayContext>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    // Authenticate before anything touches the backend
    let authorized = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| context.credentials.validate_header(v))
        .unwrap_or(false);

    if !authorized {
        debug!(client = %client_addr.ip(), method = %req.method(), path = req.uri().path(), "Rejected unauthenticated request");
        return Ok(unauthorized_response(&context.realm));
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| req.uri().authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    set_forwarded_headers(headers, client_addr, host, context.trust_forwarded);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, path, request_id, "Forwarding request");

    // One attempt only: tracking writes must never be duplicated
    match context.upstream.forward(req).await {
        Ok(response) => {
            debug!(%method, path, request_id, status = %response.status(), "Backend responded");
            Ok(response)
        }
        Err(e) if e.is_timeout() => {
            context.upstream.stats().record_failure();
            warn!(%method, path, request_id, error = %e, "Backend request timed out");
            Ok(json_error_response(GatewayErrorCode::UpstreamTimeout, e.to_string()))
        }
        Err(e) => {
            context.upstream.stats().record_failure();
            if e.is_connect() {
                warn!(%method, path, request_id, error = %e, "Backend unreachable");
            } else {
                error!(%method, path, request_id, error = %e, "Failed to forward request");
            }
            Ok(json_error_response(
                GatewayErrorCode::UpstreamUnavailable,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Set `X-Forwarded-*` for the backend.
///
/// With `trust` the proxy in front of the gateway is the one trusted hop:
/// its proto and host are kept and the peer is appended to the client chain.
/// Without it all three describe the gateway's own connection.
fn set_forwarded_headers(headers: &mut HeaderMap, peer: SocketAddr, host: Option<HeaderValue>, trust: bool) {
    let peer_ip = peer.ip().to_string();

    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(chain) if trust && !chain.trim().is_empty() => format!("{}, {}", chain.trim(), peer_ip),
        _ => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !(trust && headers.contains_key(X_FORWARDED_HOST)) {
        match host {
            Some(host) => {
                headers.insert(X_FORWARDED_HOST, host);
            }
            None => {
                headers.remove(X_FORWARDED_HOST);
            }
        }
    }

    if !(trust && headers.contains_key(X_FORWARDED_PROTO)) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
}
