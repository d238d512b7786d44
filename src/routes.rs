//! Route table construction.
//!
//! The table is ordered: framework pages first (most specific first), then
//! explicitly configured patterns, then framework rewrites. The first match
//! wins.

use crate::error::RouteError;
use crate::pages;
use crate::path_pattern;
use crate::service::Service;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A path pattern and the service that serves it
#[derive(Clone)]
pub struct Route {
    pattern: Regex,
    service: Arc<Service>,
}

impl Route {
    pub fn new(pattern: Regex, service: Arc<Service>) -> Self {
        Self { pattern, service }
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.as_str())
            .field("service", &self.service.name())
            .finish()
    }
}

/// Build the complete route table for `services`
pub async fn resolve(services: &[Arc<Service>]) -> Result<Vec<Route>, RouteError> {
    let mut routes = page_routes(services).await?;
    routes.extend(explicit_routes(services)?);
    routes.extend(rewrite_routes(services).await);
    debug!(routes = routes.len(), "Resolved route table");
    Ok(routes)
}

/// Routes for the pages of all framework services
async fn page_routes(services: &[Arc<Service>]) -> Result<Vec<Route>, RouteError> {
    let framework_services: Vec<&Arc<Service>> =
        services.iter().filter(|s| s.framework().is_some()).collect();

    let discovered = futures::future::try_join_all(
        framework_services
            .iter()
            .map(|service| pages::discover(service.root_dir())),
    )
    .await?;

    let mut owners: HashMap<String, &Arc<Service>> = HashMap::new();
    for (service, keys) in framework_services.iter().copied().zip(discovered) {
        for key in keys {
            if let Some(existing) = owners.get(&key) {
                return Err(RouteError::DuplicateRoute {
                    route: key,
                    first: existing.root_dir().to_path_buf(),
                    second: service.root_dir().to_path_buf(),
                });
            }
            owners.insert(key, service);
        }
    }

    let keys: Vec<String> = owners.keys().cloned().collect();
    let mut routes = Vec::with_capacity(keys.len());
    for key in pages::sort(&keys)? {
        let source = pages::page_regex(&key)?;
        let pattern = Regex::new(&source).map_err(|source| RouteError::InvalidPage {
            page: key.clone(),
            reason: source.to_string(),
        })?;
        if let Some(service) = owners.get(&key) {
            routes.push(Route::new(pattern, Arc::clone(service)));
        }
    }
    Ok(routes)
}

/// Routes for the patterns listed in service configs, in config order
fn explicit_routes(services: &[Arc<Service>]) -> Result<Vec<Route>, RouteError> {
    let mut routes = Vec::new();
    for service in services {
        for pattern in service.routes() {
            let regex = Regex::new(pattern).map_err(|source| RouteError::InvalidPattern {
                service: service.name().to_string(),
                pattern: pattern.clone(),
                source,
            })?;
            routes.push(Route::new(regex, Arc::clone(service)));
        }
    }
    Ok(routes)
}

/// Routes for framework rewrites. Invalid or unreadable rules are skipped.
async fn rewrite_routes(services: &[Arc<Service>]) -> Vec<Route> {
    let providers: Vec<(&Arc<Service>, _)> = services
        .iter()
        .filter_map(|service| {
            let provider = service.framework()?.rewrites()?;
            Some((service, Arc::clone(provider)))
        })
        .collect();

    let results =
        futures::future::join_all(providers.iter().map(|(_, provider)| provider.rewrites())).await;

    let mut routes = Vec::new();
    for ((service, _), result) in providers.iter().zip(results) {
        let rules = match result {
            Ok(rules) => rules,
            Err(e) => {
                warn!(service = %service.name(), error = %e, "Failed to load rewrites");
                continue;
            }
        };

        for rule in rules {
            match path_pattern::compile(&rule.source) {
                Ok(pattern) => routes.push(Route::new(pattern, Arc::clone(service))),
                Err(e) => warn!(
                    service = %service.name(),
                    source = %rule.source,
                    error = %e,
                    "Invalid Next.js rewrite detected"
                ),
            }
        }
    }
    routes
}
