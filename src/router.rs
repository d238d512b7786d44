//! Maps incoming requests to services.
//!
//! The router owns the service list and the current route table. Reloads
//! build a new table off to the side and swap it in, so lookups see either
//! the old or the new table, never a partial one.

use crate::error::{PortError, RouteError};
use crate::ports;
use crate::routes::{self, Route};
use crate::service::Service;
use crate::watch::RouteWatcher;
use hyper::header::REFERER;
use hyper::{HeaderMap, Request, Uri};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Router {
    services: Vec<Arc<Service>>,
    main_port: u16,
    routes: RwLock<Arc<Vec<Route>>>,
    /// Serialises reloads so a slow scan cannot overwrite a newer table
    reload_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<RouteWatcher>>,
}

impl Router {
    pub fn new(services: Vec<Arc<Service>>, main_port: u16) -> Arc<Self> {
        Arc::new(Self {
            services,
            main_port,
            routes: RwLock::new(Arc::new(Vec::new())),
            reload_lock: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(None),
        })
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    /// Snapshot of the current route table
    pub fn routes(&self) -> Arc<Vec<Route>> {
        Arc::clone(&self.routes.read())
    }

    /// Give services without a port one from the range above the main port
    pub async fn assign_ports(&self) -> Result<(), PortError> {
        ports::assign_ports(&self.services, self.main_port).await
    }

    /// Rebuild the route table. On error the previous table stays in place.
    pub async fn load(&self) -> Result<(), RouteError> {
        let _guard = self.reload_lock.lock().await;
        let table = routes::resolve(&self.services).await?;
        info!(routes = table.len(), "Route table loaded");
        *self.routes.write() = Arc::new(table);
        Ok(())
    }

    /// Reload routes whenever the page directories of framework services change.
    ///
    /// Calling this again while a watcher is active does nothing.
    pub fn watch(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Ok(());
        }

        let roots: Vec<_> = self
            .services
            .iter()
            .filter(|s| s.framework().is_some())
            .map(|s| s.root_dir().to_path_buf())
            .collect();
        if roots.is_empty() {
            debug!("No framework services to watch");
            return Ok(());
        }

        *watcher = Some(RouteWatcher::start(Arc::downgrade(self), &roots)?);
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Stop watching for page changes
    pub fn close_watchers(&self) {
        if self.watcher.lock().take().is_some() {
            debug!("Route watcher stopped");
        }
    }

    /// Close every service the proxy launched
    pub async fn close_services(&self) {
        for service in &self.services {
            if service.has_process() {
                service.close().await;
            }
        }
    }

    /// Find the service for a request, falling back to its referer
    pub fn match_request<B>(&self, req: &Request<B>) -> Option<Arc<Service>> {
        self.match_parts(req.uri(), req.headers())
    }

    pub fn match_parts(&self, uri: &Uri, headers: &HeaderMap) -> Option<Arc<Service>> {
        if let Some(service) = self.match_path(uri.path()) {
            return Some(service);
        }

        let referer = headers.get(REFERER)?.to_str().ok()?;
        let service = self.match_url(referer);
        if let Some(ref service) = service {
            debug!(path = %uri.path(), referer, service = %service.name(), "Matched by referer");
        }
        service
    }

    /// Find the service for an absolute or path-only URL
    pub fn match_url(&self, url: &str) -> Option<Arc<Service>> {
        let path = url_path(url)?;
        self.match_path(&path)
    }

    fn match_path(&self, path: &str) -> Option<Arc<Service>> {
        let routes = self.routes();
        routes
            .iter()
            .find(|route| route.is_match(path))
            .map(|route| Arc::clone(route.service()))
    }
}

/// Path component of a URL, resolving relative references against `/`
fn url_path(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }

    let uri: Uri = if url.starts_with('/') || url.contains("://") {
        url.parse().ok()?
    } else {
        format!("/{}", url).parse().ok()?
    };

    match uri.path() {
        "" => Some("/".to_string()),
        path => Some(path.to_string()),
    }
}
