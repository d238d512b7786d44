//! Framework integration: config detection and rewrite rules

use futures::future::BoxFuture;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Config files marking a directory as a framework service
pub const CONFIG_FILES: [&str; 4] = [
    "next.config.js",
    "next.config.mjs",
    "next.config.cjs",
    "next.config.ts",
];

/// Rewrite rules exported next to the framework config
pub const REWRITES_FILE: &str = "rewrites.json";

/// A rewrite declared by a framework service. Only `source` is used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteRule {
    pub source: String,
    #[serde(default)]
    pub destination: Option<String>,
}

impl RewriteRule {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: None,
        }
    }
}

/// Supplies the rewrite rules of a framework service
pub trait RewriteProvider: Send + Sync + fmt::Debug {
    fn rewrites(&self) -> BoxFuture<'_, anyhow::Result<Vec<RewriteRule>>>;
}

/// A fixed rule set
#[derive(Debug, Clone, Default)]
pub struct StaticRewrites(pub Vec<RewriteRule>);

impl RewriteProvider for StaticRewrites {
    fn rewrites(&self) -> BoxFuture<'_, anyhow::Result<Vec<RewriteRule>>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// Rules read from a JSON file on every call.
///
/// A missing file or a document that is not an array yields no rules.
#[derive(Debug, Clone)]
pub struct JsonFileRewrites {
    path: PathBuf,
}

impl JsonFileRewrites {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RewriteProvider for JsonFileRewrites {
    fn rewrites(&self) -> BoxFuture<'_, anyhow::Result<Vec<RewriteRule>>> {
        Box::pin(async move {
            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let value: serde_json::Value = serde_json::from_str(&content)?;
            let serde_json::Value::Array(entries) = value else {
                return Ok(Vec::new());
            };

            let rules = entries
                .into_iter()
                .filter_map(|entry| match serde_json::from_value::<RewriteRule>(entry) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        warn!(file = %self.path.display(), error = %e, "Ignoring malformed rewrite");
                        None
                    }
                })
                .collect();
            Ok(rules)
        })
    }
}

/// Framework integration of a service
#[derive(Clone)]
pub struct FrameworkConfig {
    config_file: PathBuf,
    rewrites: Option<Arc<dyn RewriteProvider>>,
}

impl FrameworkConfig {
    pub fn new(config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            rewrites: None,
        }
    }

    pub fn with_rewrites(mut self, provider: Arc<dyn RewriteProvider>) -> Self {
        self.rewrites = Some(provider);
        self
    }

    /// Detect a framework service rooted at `root_dir`
    pub fn detect(root_dir: &Path) -> Option<Self> {
        let config_file = find_config_file(root_dir)?;
        let rewrites = JsonFileRewrites::new(root_dir.join(REWRITES_FILE));
        Some(Self::new(config_file).with_rewrites(Arc::new(rewrites)))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn rewrites(&self) -> Option<&Arc<dyn RewriteProvider>> {
        self.rewrites.as_ref()
    }
}

impl fmt::Debug for FrameworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameworkConfig")
            .field("config_file", &self.config_file)
            .field("rewrites", &self.rewrites)
            .finish()
    }
}

/// Find the framework config file in `dir`
pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}
