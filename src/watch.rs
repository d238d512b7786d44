//! Reloads the route table when framework services change on disk.
//!
//! Page directories are watched recursively. The service root is watched on
//! its own so that edits to the framework config or its rewrites also
//! trigger a reload.

use crate::framework::{CONFIG_FILES, REWRITES_FILE};
use crate::pages;
use crate::router::Router;
use anyhow::Context;
use notify_debouncer_full::{
    new_debouncer,
    notify::{RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(300);

/// Active watch over the framework services of a router
pub struct RouteWatcher {
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    reloader: JoinHandle<()>,
}

impl RouteWatcher {
    pub fn start(router: Weak<Router>, roots: &[PathBuf]) -> anyhow::Result<Self> {
        let (change_tx, mut change_rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let changed: Vec<PathBuf> = events
                        .iter()
                        .flat_map(|event| event.paths.iter())
                        .filter(|path| is_route_source(path))
                        .cloned()
                        .collect();
                    if !changed.is_empty() {
                        let _ = change_tx.send(changed);
                    }
                }
                Err(errors) => {
                    warn!("Watch error: {:?}", errors);
                }
            }
        })
        .context("Failed to create file watcher")?;

        for root in roots {
            debouncer
                .watcher()
                .watch(root, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {}", root.display()))?;
            for dir in pages::page_dirs(root) {
                debouncer
                    .watcher()
                    .watch(&dir, RecursiveMode::Recursive)
                    .with_context(|| format!("Failed to watch {}", dir.display()))?;
                debug!(path = %dir.display(), "Watching pages");
            }
        }

        let reloader = tokio::spawn(async move {
            while let Some(changed) = change_rx.recv().await {
                // Coalesce bursts into a single reload
                let mut count = changed.len();
                while let Ok(more) = change_rx.try_recv() {
                    count += more.len();
                }

                let Some(router) = router.upgrade() else {
                    break;
                };
                info!(changes = count, "Route sources changed, reloading");
                if let Err(e) = router.load().await {
                    warn!(error = %e, "Failed to reload routes, keeping previous table");
                }
            }
        });

        Ok(Self {
            _debouncer: debouncer,
            reloader,
        })
    }
}

impl Drop for RouteWatcher {
    fn drop(&mut self) {
        self.reloader.abort();
    }
}

/// Whether a change to `path` can affect the route table
fn is_route_source(path: &Path) -> bool {
    if should_ignore_path(path) {
        return false;
    }

    let in_pages = path
        .components()
        .any(|c| c.as_os_str() == "pages");
    if in_pages {
        return true;
    }

    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == REWRITES_FILE || CONFIG_FILES.contains(&name))
}

/// Check if a path should be ignored (build output, dependencies, editor files)
fn should_ignore_path(path: &Path) -> bool {
    let ignore_patterns = ["node_modules", ".git", ".next", "dist"];
    if path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| ignore_patterns.contains(&s))
    }) {
        return true;
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.ends_with('~') || name.ends_with(".swp") || name.starts_with(".#")
}
