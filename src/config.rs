use crate::framework;
use anyhow::Context;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "microproxy.toml";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Port the proxy listens on (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Launch services on demand when nothing is listening on their port
    #[serde(default)]
    pub autostart: bool,

    /// Discover framework services in the subdirectories of the config directory
    #[serde(default)]
    pub autoload: bool,

    /// Command used to run framework services, `--dir` and `--port` are appended
    #[serde(default = "default_worker")]
    pub worker: String,

    /// Grace period in seconds between SIGTERM and SIGKILL when closing a service
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Backend services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Configuration for a single backend service
///
/// # Security Warning
///
/// The `script` and `interpreter` fields are executed directly. Configuration
/// files must come from trusted sources only.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ServiceConfig {
    /// Display name (falls back to the package name, then `service {id}`)
    pub name: Option<String>,

    /// Version shown in the startup summary (falls back to the package version)
    pub version: Option<String>,

    /// Root directory of the service
    pub root_dir: PathBuf,

    /// Port the service listens on (assigned automatically when absent)
    pub port: Option<u16>,

    /// Regular expressions matched against the request path
    #[serde(default)]
    pub routes: Vec<String>,

    /// Start script, absolute or relative to `root_dir`
    pub script: Option<PathBuf>,

    /// Program used to run the script (defaults to `node` for JavaScript files)
    pub interpreter: Option<String>,

    /// How long to wait for the readiness signal after launching (default: 60s)
    pub script_wait_timeout_ms: Option<u64>,

    /// Close the service after this long without a proxied request
    pub ttl_ms: Option<u64>,

    /// Environment variables passed to the service
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Extra environment variables per named environment (selected with `--env`)
    #[serde(default)]
    pub envs: HashMap<String, HashMap<String, String>>,
}

impl ServiceConfig {
    /// Create a service config rooted at the given directory
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_routes(mut self, routes: &[&str]) -> Self {
        self.routes = routes.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_interpreter(mut self, interpreter: &str) -> Self {
        self.interpreter = Some(interpreter.to_string());
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_script_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.script_wait_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn script_wait_timeout(&self) -> Duration {
        Duration::from_millis(
            self.script_wait_timeout_ms
                .unwrap_or_else(default_script_wait_timeout),
        )
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    /// The start script resolved against the root directory
    pub fn script_path(&self) -> Option<PathBuf> {
        self.script.as_ref().map(|script| {
            if script.is_absolute() {
                script.clone()
            } else {
                self.root_dir.join(script)
            }
        })
    }

    /// Environment overrides for a launch, with the named environment applied on top
    pub fn environment(&self, env_name: Option<&str>) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if let Some(overrides) = env_name.and_then(|name| self.envs.get(name)) {
            env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.root_dir.is_relative() {
            self.root_dir = base.join(&self.root_dir);
        }
    }

    /// Validate the service configuration
    pub fn validate(&self, index: usize) -> Result<(), String> {
        if !self.root_dir.is_dir() {
            return Err(format!(
                "services[{}].root_dir: '{}' is not a directory",
                index,
                self.root_dir.display()
            ));
        }

        if let Some(script) = self.script_path() {
            if !script.is_file() {
                return Err(format!(
                    "services[{}].script: '{}' is not a file",
                    index,
                    script.display()
                ));
            }
        }

        if self.port == Some(0) {
            return Err(format!("services[{}].port: must be greater than 0", index));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            autostart: false,
            autoload: false,
            worker: default_worker(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            services: Vec::new(),
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    3000
}

fn default_worker() -> String {
    "next-micro-worker".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_script_wait_timeout() -> u64 {
    60_000
}

impl Config {
    /// Load, resolve and validate the configuration file.
    ///
    /// Relative service paths are resolved against the directory of the file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        config.resolve_paths(&base);
        if config.autoload {
            config.autoload_services(&base)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for service in &mut self.services {
            service.resolve_paths(base);
        }
    }

    /// Add a service for every direct subdirectory holding a framework config file
    fn autoload_services(&mut self, base: &Path) -> anyhow::Result<()> {
        let known: HashSet<PathBuf> = self
            .services
            .iter()
            .map(|s| s.root_dir.canonicalize().unwrap_or_else(|_| s.root_dir.clone()))
            .collect();

        let mut discovered = Vec::new();
        let entries = std::fs::read_dir(base)
            .with_context(|| format!("Failed to scan {} for services", base.display()))?;
        for entry in entries {
            let dir = entry?.path();
            if !dir.is_dir() || framework::find_config_file(&dir).is_none() {
                continue;
            }
            let canonical = dir.canonicalize().unwrap_or_else(|_| dir.clone());
            if !known.contains(&canonical) {
                discovered.push(dir);
            }
        }

        // read_dir order is platform dependent
        discovered.sort();
        self.services
            .extend(discovered.into_iter().map(ServiceConfig::new));
        Ok(())
    }

    /// Parse the worker command line
    pub fn worker_command(&self) -> anyhow::Result<Vec<String>> {
        let words = shell_words::split(&self.worker)
            .with_context(|| format!("Invalid worker command '{}'", self.worker))?;
        if words.is_empty() {
            anyhow::bail!("Worker command must not be empty");
        }
        Ok(words)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("port: must be greater than 0".to_string());
        }

        if let Err(e) = self.worker_command() {
            errors.push(format!("worker: {}", e));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();

        for (index, service) in self.services.iter().enumerate() {
            if let Err(e) = service.validate(index) {
                errors.push(e);
            }

            if let Some(ref name) = service.name {
                if !names.insert(name.as_str()) {
                    errors.push(format!("services[{}].name: '{}' is not unique", index, name));
                }
            }

            if let Some(port) = service.port {
                if port == self.port {
                    errors.push(format!(
                        "port: collides with services[{}].port",
                        index
                    ));
                } else if !ports.insert(port) {
                    errors.push(format!("services[{}].port: {} is not unique", index, port));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
