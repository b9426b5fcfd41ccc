// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatcher: side-channel endpoints, backend selection, forwarding and
// passive health observation.
// ────────────────────────────────

use super::{Backend, BackendPool};
use crate::config::Config;
use crate::health::{health_summary, StatusReport};
use crate::load_balancer::LoadBalancer;
use crate::logging::ACCESS_LOG_TARGET;
use crate::metrics::MetricsCollector;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, USER_AGENT};
use hyper::{Body, Client, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use hyper_tls::HttpsConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";
const X_REQUEST_ID: &str = "x-request-id";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

pub struct Proxy {
    pool: Arc<BackendPool>,
    algorithm: Arc<dyn LoadBalancer>,
    client: HttpClient,
    request_timeout: Duration,
    access_log: bool,
    metrics: Option<Arc<MetricsCollector>>,
    started_at: Instant,
}

impl Proxy {
    pub fn new(
        config: &Config,
        pool: Arc<BackendPool>,
        algorithm: Arc<dyn LoadBalancer>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());

        Self {
            pool,
            algorithm,
            client,
            request_timeout: config.server.request_timeout(),
            access_log: config.logging.access_log,
            metrics,
            started_at: Instant::now(),
        }
    }

    #[cfg(test)]
    fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Every request resolves to a response; failures are rendered, never propagated.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let client_addr = req.extensions().get::<SocketAddr>().copied();
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_owned();
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (mut response, backend) = match (&method, path.as_str()) {
            (&Method::GET, "/health") => (self.health_response().await, None),
            (&Method::GET, "/status") => (self.status_response().await, None),
            _ => match self.forward(req, client_addr, &request_id).await {
                Ok((response, backend)) => (response, Some(backend.id.clone())),
                Err(e) => {
                    let backend = e.backend().map(str::to_owned);
                    match &e {
                        ProxyError::NoHealthyBackends => warn!("No healthy backends available"),
                        other => debug!(%request_id, "Request failed: {}", other),
                    }
                    (e.into(), backend)
                }
            },
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        let status = response.status().as_u16();
        let duration = start.elapsed();
        let backend = backend.as_deref().unwrap_or("-");

        if let Some(metrics) = &self.metrics {
            metrics.record_request(method.as_str(), status, backend, duration);
        }

        if self.access_log {
            let remote_addr = client_addr.map_or_else(|| "-".to_string(), |a| a.to_string());
            info!(
                target: ACCESS_LOG_TARGET,
                method = %method,
                path = %path,
                remote_addr = %remote_addr,
                user_agent = %user_agent,
                status_code = status,
                duration_ms = duration.as_millis() as u64,
                backend = %backend,
                request_id = %request_id,
                "{} {} - {}", method, path, status
            );
        }

        response
    }

    async fn health_response(&self) -> Response<Body> {
        let healthy = self.pool.healthy_size().await;
        let total = self.pool.size().await;
        let (ok, body) = health_summary(healthy, total);

        let status = if ok {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        text_response(status, body)
    }

    async fn status_response(&self) -> Response<Body> {
        let mut backends = Vec::new();
        for backend in self.pool.snapshot().await {
            backends.push(backend.report().await);
        }

        let report = StatusReport {
            status: "ok",
            healthy_backends: backends.iter().filter(|b| b.available).count(),
            total_backends: backends.len(),
            algorithm: self.algorithm.name(),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started_at.elapsed().as_secs(),
            backends,
        };

        match serde_json::to_vec(&report) {
            Ok(body) => {
                let mut response = Response::new(Body::from(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(e) => {
                error!("Failed to encode status report: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    async fn forward(
        &self,
        mut req: Request<Body>,
        client_addr: Option<SocketAddr>,
        request_id: &str,
    ) -> Result<(Response<Body>, Arc<Backend>), ProxyError> {
        // Filtering is the algorithm's job; hand it the full snapshot
        let backends = self.pool.snapshot().await;
        let backend = self
            .algorithm
            .next_backend(&backends)
            .await
            .ok_or(ProxyError::NoHealthyBackends)?;

        let uri = upstream_uri(&backend.url, req.uri())?;
        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;
        prepare_upstream_headers(req.headers_mut(), client_addr, request_id);

        let method = req.method().clone();
        let start = Instant::now();
        let outcome = timeout(self.request_timeout, self.client.request(req)).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(mut response)) => {
                let status = response.status();
                let success = status.as_u16() < 500;

                if success {
                    if backend.mark_healthy().await {
                        info!("Backend {} is now healthy (observed from traffic)", backend.id);
                    }
                } else if backend.mark_unhealthy().await {
                    warn!("Backend {} is now unhealthy after upstream {}", backend.id, status);
                }

                debug!(
                    "Backend request: {} {} - {} in {:?}",
                    method, backend.url, status.as_u16(), elapsed
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_backend_request(&backend.id, success, elapsed);
                }

                strip_hop_by_hop(response.headers_mut());
                Ok((response, backend))
            }
            Ok(Err(e)) => {
                self.observe_failure(&backend, elapsed).await;
                error!("Backend request failed: {} {}: {}", method, backend.url, e);
                Err(ProxyError::BackendError {
                    backend: backend.id.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.observe_failure(&backend, elapsed).await;
                error!(
                    "Backend request timed out: {} {} after {:?}",
                    method, backend.url, self.request_timeout
                );
                Err(ProxyError::Timeout(backend.id.clone()))
            }
        }
    }

    async fn observe_failure(&self, backend: &Backend, elapsed: Duration) {
        if backend.mark_unhealthy().await {
            warn!("Backend {} is now unhealthy after transport failures", backend.id);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_request(&backend.id, false, elapsed);
        }
    }
}

/// Backend scheme and authority, backend base path joined to the request path with
/// one slash, and both query strings.
fn upstream_uri(base: &Url, incoming: &Uri) -> Result<Uri, ProxyError> {
    let host = base.host_str().unwrap_or_default();
    let mut target = match base.port() {
        Some(port) => format!("{}://{}:{}", base.scheme(), host, port),
        None => format!("{}://{}", base.scheme(), host),
    };

    target.push_str(base.path().trim_end_matches('/'));
    let path = incoming.path();
    if !path.starts_with('/') {
        target.push('/');
    }
    target.push_str(path);

    let queries: Vec<&str> = [base.query(), incoming.query()]
        .into_iter()
        .flatten()
        .filter(|q| !q.is_empty())
        .collect();
    if !queries.is_empty() {
        target.push('?');
        target.push_str(&queries.join("&"));
    }

    target
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::InvalidUri(e.to_string()))
}

fn prepare_upstream_headers(
    headers: &mut HeaderMap,
    client_addr: Option<SocketAddr>,
    request_id: &str,
) {
    strip_hop_by_hop(headers);

    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
            _ => ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if !headers.contains_key(X_REAL_IP) {
            if let Ok(value) = HeaderValue::from_str(&ip) {
                headers.insert(X_REAL_IP, value);
            }
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
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

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Backend {backend} error: {message}")]
    BackendError { backend: String, message: String },

    #[error("Backend {0} timed out")]
    Timeout(String),

    #[error("Invalid upstream URI: {0}")]
    InvalidUri(String),
}

impl ProxyError {
    pub fn backend(&self) -> Option<&str> {
        match self {
            ProxyError::BackendError { backend, .. } | ProxyError::Timeout(backend) => {
                Some(backend.as_str())
            }
            _ => None,
        }
    }
}

// A timeout is handled like any other transport failure
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match err {
            ProxyError::NoHealthyBackends => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
            }
            ProxyError::BackendError { .. } | ProxyError::Timeout(_) => {
                (StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
            ProxyError::InvalidUri(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
        };

        text_response(status, message)
    }
}
