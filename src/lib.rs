//! A local reverse proxy for development.
//!
//! One port fronts several backend services. Requests are routed by path
//! (or by their referer) to the owning service, and services that are not
//! running are started on demand.

pub mod config;
pub mod error;
pub mod framework;
pub mod package;
pub mod pages;
pub mod path_pattern;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod router;
pub mod routes;
pub mod service;
pub mod watch;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
