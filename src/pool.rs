//! Connection pool for backend HTTP connections
//!
//! Requests are forwarded with fully buffered bodies so a request can be
//! replayed once after its service has been started.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Headers that describe the client connection and are not forwarded
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
    /// The service has no port yet
    #[error("Service has no port assigned")]
    NoPort,
}

impl PoolError {
    /// Whether nothing was listening on the backend port
    pub fn is_connection_refused(&self) -> bool {
        let PoolError::Client(err) = self else {
            return false;
        };
        if !err.is_connect() {
            return false;
        }

        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return io.kind() == std::io::ErrorKind::ConnectionRefused;
            }
            source = cause.source();
        }
        false
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to local services
pub struct ConnectionPool {
    client: Client<HttpConnector, Full<Bytes>>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send a request to the service listening on `port` on loopback.
    ///
    /// Method, path, query and headers are taken from `parts`; the body is
    /// replayed from `body`.
    pub async fn send_request(
        &self,
        parts: &Parts,
        body: Bytes,
        port: u16,
    ) -> Result<Response<Incoming>, PoolError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        let connection_headers = connection_header_names(&parts.headers);
        for (key, value) in parts.headers.iter() {
            if is_hop_by_hop(key) || connection_headers.contains(key) {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(Full::new(body))
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.client.request(backend_req).await.map_err(|e| {
            debug!(port, error = %e, "Backend request failed");
            PoolError::from(e)
        })
    }
}

/// Whether a header only applies to a single connection
fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Extra headers the client marked as hop-by-hop in its `Connection` header
fn connection_header_names(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}
