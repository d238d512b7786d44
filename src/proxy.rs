use crate::error::{not_found, should_be_served_by};
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::router::Router;
use crate::service::Service;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Name of the service that answered
pub const X_SERVICE_NAME: &str = "x-service-name";
/// Port of the service that answered
pub const X_SERVICE_PORT: &str = "x-service-port";

/// How long open connections get to finish after shutdown is requested
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How the proxy reacts to services that are not running
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSettings {
    pub dev_mode: bool,
    pub autostart: bool,
}

impl DispatchSettings {
    fn launches_on_demand(&self) -> bool {
        self.dev_mode && self.autostart
    }
}

/// The main reverse proxy server
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        settings: DispatchSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let dispatcher = Arc::new(Dispatcher {
            router,
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            settings,
        });

        Ok(Self {
            listener,
            local_addr,
            dispatcher,
            shutdown_rx,
        })
    }

    /// Address the proxy is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "Proxy server listening (HTTP/1.1)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let dispatcher = Arc::clone(&dispatcher);
                                async move { dispatcher.dispatch(req, addr).await }
                            });

                            let conn = http1::Builder::new()
                                .preserve_header_case(true)
                                .serve_connection(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn);

                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, proxy server shutting down");
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        self.dispatcher.router.close_watchers();

        tokio::select! {
            _ = graceful.shutdown() => {
                debug!("All connections closed");
            }
            _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                warn!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "Timed out waiting for connections to close"
                );
            }
        }

        Ok(())
    }
}

/// Routes each request to its service, launching the service when needed
struct Dispatcher {
    router: Arc<Router>,
    pool: Arc<ConnectionPool>,
    settings: DispatchSettings,
}

impl Dispatcher {
    async fn dispatch(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let Some(service) = self.router.match_request(&req) else {
            debug!(method = %req.method(), uri = %req.uri(), "No matching route");
            return Ok(not_found());
        };

        let (mut parts, body) = req.into_parts();
        // Buffered so the request can be replayed after a launch
        let body = body.collect().await?.to_bytes();

        let request_id = add_forwarding_headers(&mut parts.headers, client_addr);
        debug!(
            method = %parts.method,
            uri = %parts.uri,
            service = %service.name(),
            request_id,
            "Incoming request"
        );

        service.refresh_ttl();

        match self.forward(&service, &parts, body.clone()).await {
            Ok(response) => Ok(response),
            Err(e) => Ok(self.recover(&parts, body, e).await),
        }
    }

    async fn forward(
        &self,
        service: &Arc<Service>,
        parts: &Parts,
        body: Bytes,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let port = service.port().ok_or(PoolError::NoPort)?;
        let response = self.pool.send_request(parts, body, port).await?;
        Ok(finish_response(response, service, port, parts.headers.get(HOST)))
    }

    /// Handle a request whose service did not answer
    async fn recover(&self, parts: &Parts, body: Bytes, err: PoolError) -> Response<ProxyBody> {
        let Some(service) = self.router.match_parts(&parts.uri, &parts.headers) else {
            return not_found();
        };

        if !(self.settings.launches_on_demand() && err.is_connection_refused()) {
            warn!(service = %service.name(), uri = %parts.uri, error = %err, "Failed to forward request");
            return should_be_served_by(service.name());
        }

        if !service.can_launch() {
            warn!(
                service = %service.name(),
                "Service is not running and cannot be started automatically as no script was defined"
            );
            return not_found();
        }

        info!(service = %service.name(), "Service is not running, starting it");
        if !service.launch().await {
            return should_be_served_by(service.name());
        }
        service.refresh_ttl();

        match self.forward(&service, parts, body).await {
            Ok(response) => response,
            Err(e) => {
                error!(service = %service.name(), error = %e, "Failed to forward request after launch");
                should_be_served_by(service.name())
            }
        }
    }
}

/// Overwrite the X-Forwarded-* headers and return the request ID
fn add_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr) -> String {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

/// Mark the service running and stamp the response with where it came from
fn finish_response(
    response: Response<Incoming>,
    service: &Service,
    port: u16,
    original_host: Option<&HeaderValue>,
) -> Response<ProxyBody> {
    service.mark_running();

    let (mut parts, body) = response.into_parts();
    if let Ok(value) = HeaderValue::from_str(service.name()) {
        parts.headers.insert(X_SERVICE_NAME, value);
    }
    parts
        .headers
        .insert(X_SERVICE_PORT, HeaderValue::from(port));
    if is_redirect(parts.status) {
        rewrite_location(&mut parts.headers, port, original_host);
    }

    Response::from_parts(parts, body.boxed())
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 201 | 301 | 302 | 307 | 308)
}

/// Point redirects at the service's loopback port back to the proxy's host
fn rewrite_location(headers: &mut HeaderMap, port: u16, original_host: Option<&HeaderValue>) {
    let Some(host) = original_host.and_then(|h| h.to_str().ok()) else {
        return;
    };
    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Ok(uri) = location.parse::<Uri>() else {
        return;
    };
    let Some(authority) = uri.authority() else {
        return;
    };
    if authority.port_u16() != Some(port)
        || !matches!(authority.host(), "127.0.0.1" | "localhost")
    {
        return;
    }

    let rewritten = format!(
        "{}://{}{}",
        uri.scheme_str().unwrap_or("http"),
        host,
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(LOCATION, value);
    }
}
