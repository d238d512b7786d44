//! Error types and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;
use thiserror::Error;

/// Error codes for requests the proxy answers itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No route matched the request path or its referer
    NoMatchingRoute,
    /// The matched service could not serve the request
    ServiceUnavailable,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoMatchingRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::ServiceUnavailable => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoMatchingRoute => "NO_MATCHING_ROUTE",
            ProxyErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Bytes::from(message.into());
    let mut response = Response::new(Full::new(body).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// 404 for requests no service claims
pub fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(ProxyErrorCode::NoMatchingRoute, "Not Found")
}

/// 400 naming the service that should have answered
pub fn should_be_served_by(service: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(
        ProxyErrorCode::ServiceUnavailable,
        format!("Should be served by {}", service),
    )
}

/// Errors raised while building the route table
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(
        "The \"{route}\" route has been defined multiple times, in both {} and {}. \
         Please check the pages directories of your Next.js services.",
        first.display(),
        second.display()
    )]
    DuplicateRoute {
        route: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Invalid page \"{page}\": {reason}")]
    InvalidPage { page: String, reason: String },

    #[error("Invalid route pattern \"{pattern}\" for service {service}: {source}")]
    InvalidPattern {
        service: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to scan pages in {}: {source}", dir.display())]
    PageScan {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while assigning service ports
#[derive(Debug, Error)]
pub enum PortError {
    #[error("No free port left in range {start}-{end} for service {service}")]
    RangeExhausted {
        service: String,
        start: u16,
        end: u16,
    },
}
