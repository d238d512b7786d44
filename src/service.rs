//! Backend services and their process lifecycle.
//!
//! A service is launched on demand: the start command is spawned with `PORT`
//! set, and the service counts as running once the child writes `ready` to
//! the loopback socket advertised in `MICROPROXY_READY_ADDR`. Concurrent
//! launches share one child process.
//!
//! Methods that spawn background tasks (`launch`, `refresh_ttl`) take
//! `&Arc<Self>` so the tasks can own a handle to the service.

use crate::config::ServiceConfig;
use crate::framework::FrameworkConfig;
use crate::package::PackageInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Loopback address the child reports readiness to
pub const READY_ADDR_ENV: &str = "MICROPROXY_READY_ADDR";
/// Port of [`READY_ADDR_ENV`], for clients that only take a port
pub const READY_PORT_ENV: &str = "MICROPROXY_READY_PORT";

const READY_MESSAGE: &str = "ready";
const READY_READ_TIMEOUT: Duration = Duration::from_secs(5);
const NODE_EXTENSIONS: [&str; 3] = ["js", "mjs", "cjs"];
const UNKNOWN_VERSION: &str = "unknown";

/// Process settings shared by all services
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Command for framework services, `--dir` and `--port` are appended
    pub worker: Vec<String>,
    /// Named environment applied on top of each service's `env`
    pub env_name: Option<String>,
    /// Time between SIGTERM and SIGKILL on close
    pub shutdown_grace_period: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            worker: vec!["next-micro-worker".to_string()],
            env_name: None,
            shutdown_grace_period: Duration::from_secs(5),
        }
    }
}

/// Program and arguments used to start a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Status summary for logging
#[derive(Debug, Clone)]
pub struct ServiceSummary {
    pub id: usize,
    pub name: String,
    pub version: String,
    pub port: Option<u16>,
    pub framework: bool,
    pub running: bool,
}

/// A spawned child, owned by its monitor task
struct ProcessHandle {
    launch_id: u64,
    pid: Option<u32>,
    stop_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

impl ProcessHandle {
    /// Ask the monitor to terminate the child and wait until it has
    async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.monitor.await {
            warn!(error = %e, "Process monitor task failed");
        }
    }
}

struct TtlTimer {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ServiceState {
    port: Option<u16>,
    process: Option<ProcessHandle>,
    launches: u64,
    ttl_timer: Option<TtlTimer>,
    ttl_generation: u64,
}

/// A backend the proxy routes to
pub struct Service {
    id: usize,
    name: String,
    version: String,
    config: ServiceConfig,
    framework: Option<FrameworkConfig>,
    settings: Arc<LaunchSettings>,
    state: Mutex<ServiceState>,
    running: watch::Sender<bool>,
    /// Bumped whenever a process is closed or exits, so launch waiters stop waiting
    stops: watch::Sender<u64>,
}

impl Service {
    pub fn new(
        id: usize,
        config: ServiceConfig,
        framework: Option<FrameworkConfig>,
        package: Option<PackageInfo>,
        settings: Arc<LaunchSettings>,
    ) -> Arc<Self> {
        let package = package.unwrap_or_default();
        let name = config
            .name
            .clone()
            .or(package.name)
            .unwrap_or_else(|| format!("service {}", id));
        let version = config
            .version
            .clone()
            .or(package.version)
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        let state = ServiceState {
            port: config.port,
            ..ServiceState::default()
        };

        Arc::new(Self {
            id,
            name,
            version,
            config,
            framework,
            settings,
            state: Mutex::new(state),
            running: watch::Sender::new(false),
            stops: watch::Sender::new(0),
        })
    }

    /// Build a service, detecting the framework integration and package manifest
    pub fn from_config(id: usize, config: ServiceConfig, settings: Arc<LaunchSettings>) -> Arc<Self> {
        let framework = FrameworkConfig::detect(&config.root_dir);
        let package = PackageInfo::read(&config.root_dir).unwrap_or_else(|e| {
            warn!(root_dir = %config.root_dir.display(), error = %e, "Ignoring package manifest");
            None
        });
        Self::new(id, config, framework, package, settings)
    }

    /// Build services in configuration order, numbering them from 1
    pub fn create_all(configs: Vec<ServiceConfig>, settings: Arc<LaunchSettings>) -> Vec<Arc<Self>> {
        configs
            .into_iter()
            .enumerate()
            .map(|(i, config)| Self::from_config(i + 1, config, Arc::clone(&settings)))
            .collect()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured version, then the package version, then `"unknown"`
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Explicit route patterns
    pub fn routes(&self) -> &[String] {
        &self.config.routes
    }

    pub fn framework(&self) -> Option<&FrameworkConfig> {
        self.framework.as_ref()
    }

    pub fn port(&self) -> Option<u16> {
        self.state.lock().port
    }

    pub fn set_port(&self, port: u16) {
        self.state.lock().port = Some(port);
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Record that the service answers requests
    pub fn mark_running(&self) {
        if !self.running.send_replace(true) {
            debug!(service = %self.name, "Service marked as running");
        }
    }

    /// Whether a child process launched by the proxy is alive
    pub fn has_process(&self) -> bool {
        self.state.lock().process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().process.as_ref().and_then(|p| p.pid)
    }

    /// Whether the proxy knows how to start this service
    pub fn can_launch(&self) -> bool {
        match self.framework {
            Some(_) => !self.settings.worker.is_empty(),
            None => self.config.script.is_some(),
        }
    }

    pub fn summary(&self) -> ServiceSummary {
        ServiceSummary {
            id: self.id,
            name: self.name.clone(),
            version: self.version.clone(),
            port: self.port(),
            framework: self.framework.is_some(),
            running: self.is_running(),
        }
    }

    /// The command that starts this service on `port`
    pub fn launch_command(&self, port: u16) -> Option<LaunchCommand> {
        if self.framework.is_some() {
            let (program, rest) = self.settings.worker.split_first()?;
            let mut args = rest.to_vec();
            args.extend([
                "--dir".to_string(),
                self.root_dir().display().to_string(),
                "--port".to_string(),
                port.to_string(),
            ]);
            return Some(LaunchCommand {
                program: program.clone(),
                args,
            });
        }

        let script = self.config.script_path()?;
        let script_arg = script.display().to_string();
        let is_node = script
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| NODE_EXTENSIONS.contains(&ext));

        let command = match &self.config.interpreter {
            Some(interpreter) => LaunchCommand {
                program: interpreter.clone(),
                args: vec![script_arg],
            },
            None if is_node => LaunchCommand {
                program: "node".to_string(),
                args: vec![script_arg],
            },
            None => LaunchCommand {
                program: script_arg,
                args: Vec::new(),
            },
        };
        Some(command)
    }

    /// Environment variables set on top of the inherited environment
    pub fn environment(&self) -> HashMap<String, String> {
        self.config.environment(self.settings.env_name.as_deref())
    }

    /// Start the service and wait until it signals readiness.
    ///
    /// Returns `true` once the service is running. A launch that is already
    /// in flight is joined rather than started twice. Returns `false` when the
    /// service cannot be started or does not become ready within the script
    /// wait timeout; the child is left running in that case. A close or an
    /// exit of the child during the wait ends it with `false` straight away.
    pub async fn launch(self: &Arc<Self>) -> bool {
        let timeout = self.config.script_wait_timeout();
        let running = self.running.subscribe();
        let stops = self.stops.subscribe();

        {
            let mut state = self.state.lock();
            if self.is_running() {
                return true;
            }

            if state.process.is_some() {
                debug!(service = %self.name, "Launch already in progress, waiting for readiness");
            } else {
                let Some(port) = state.port else {
                    error!(service = %self.name, "Service has no port assigned");
                    return false;
                };
                let Some(command) = self.launch_command(port) else {
                    error!(service = %self.name, "Service has no startup script");
                    return false;
                };
                if let Err(e) = self.spawn_process(&mut state, command, port) {
                    error!(service = %self.name, error = %e, "Failed to start service");
                    return false;
                }
            }
        }

        match tokio::time::timeout(timeout, wait_until_running(running, stops)).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(service = %self.name, "Service stopped before signalling readiness");
                false
            }
            Err(_) => {
                warn!(
                    service = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Service did not signal readiness in time"
                );
                false
            }
        }
    }

    fn spawn_process(
        self: &Arc<Self>,
        state: &mut ServiceState,
        command: LaunchCommand,
        port: u16,
    ) -> anyhow::Result<()> {
        let ready_listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        ready_listener.set_nonblocking(true)?;
        let ready_addr = ready_listener.local_addr()?;
        let ready_listener = TcpListener::from_std(ready_listener)?;

        info!(
            service = %self.name,
            program = %command.program,
            args = ?command.args,
            port,
            "Starting service"
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        cmd.current_dir(self.root_dir());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd.env("PORT", port.to_string());
        for (key, value) in self.environment() {
            cmd.env(key, value);
        }
        cmd.env(READY_ADDR_ENV, ready_addr.to_string());
        cmd.env(READY_PORT_ENV, ready_addr.port().to_string());

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(service = %self.name, pid, "Service process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(self.name.clone(), OutputStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(self.name.clone(), OutputStream::Stderr, stderr));
        }

        state.launches += 1;
        let launch_id = state.launches;

        let readiness = tokio::spawn(Arc::clone(self).accept_ready_signal(ready_listener));
        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(Arc::clone(self).monitor(child, launch_id, stop_rx, readiness));

        state.process = Some(ProcessHandle {
            launch_id,
            pid,
            stop_tx,
            monitor,
        });
        Ok(())
    }

    /// Wait for the child to report readiness on the loopback listener
    async fn accept_ready_signal(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(service = %self.name, error = %e, "Readiness listener failed");
                    return;
                }
            };

            let mut line = String::new();
            let mut reader = BufReader::new(stream);
            match tokio::time::timeout(READY_READ_TIMEOUT, reader.read_line(&mut line)).await {
                Ok(Ok(_)) if line.trim() == READY_MESSAGE => {
                    info!(service = %self.name, "Service is ready");
                    self.mark_running();
                    return;
                }
                Ok(Ok(_)) => {
                    debug!(service = %self.name, message = %line.trim(), "Ignoring readiness message");
                }
                Ok(Err(e)) => {
                    debug!(service = %self.name, error = %e, "Failed to read readiness message");
                }
                Err(_) => {
                    debug!(service = %self.name, "Timed out reading readiness message");
                }
            }
        }
    }

    /// Own the child until it exits or a stop is requested
    async fn monitor(
        self: Arc<Self>,
        mut child: Child,
        launch_id: u64,
        stop_rx: oneshot::Receiver<()>,
        readiness: JoinHandle<()>,
    ) {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_rx => None,
        };
        readiness.abort();

        match exited {
            Some(status) => {
                match status {
                    Ok(status) => warn!(service = %self.name, %status, "Service process exited"),
                    Err(e) => warn!(service = %self.name, error = %e, "Error waiting for service process"),
                }

                let mut state = self.state.lock();
                if state.process.as_ref().map(|p| p.launch_id) == Some(launch_id) {
                    state.process = None;
                    if let Some(timer) = state.ttl_timer.take() {
                        timer.task.abort();
                    }
                    self.running.send_replace(false);
                    self.stops.send_modify(|stops| *stops += 1);
                }
            }
            None => {
                terminate(&self.name, &mut child, self.settings.shutdown_grace_period).await;
            }
        }
    }

    /// Stop the child process launched by the proxy.
    ///
    /// Only processes the proxy started are touched; a service that was found
    /// running on its own is left alone.
    pub async fn close(&self) {
        let handle = {
            let mut state = self.state.lock();
            if let Some(timer) = state.ttl_timer.take() {
                timer.task.abort();
            }
            let Some(handle) = state.process.take() else {
                warn!(service = %self.name, "Service is not running");
                return;
            };
            self.running.send_replace(false);
            self.stops.send_modify(|stops| *stops += 1);
            handle
        };

        info!(service = %self.name, pid = handle.pid, "Closing service");
        handle.stop().await;
    }

    /// Restart the idle countdown. No-op for services without a TTL.
    pub fn refresh_ttl(self: &Arc<Self>) {
        let Some(ttl) = self.config.ttl() else {
            return;
        };

        let mut state = self.state.lock();
        if let Some(timer) = state.ttl_timer.take() {
            timer.task.abort();
        }
        state.ttl_generation += 1;
        let generation = state.ttl_generation;

        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                let starting = {
                    let mut state = service.state.lock();
                    if state.ttl_timer.as_ref().map(|t| t.generation) != Some(generation) {
                        return;
                    }
                    // A launch in flight is not idle, the countdown restarts once it is ready
                    if state.process.is_some() && !service.is_running() {
                        Some((service.running.subscribe(), service.stops.subscribe()))
                    } else {
                        state.ttl_timer = None;
                        None
                    }
                };
                let Some((running, stops)) = starting else {
                    break;
                };
                debug!(service = %service.name, "Service is still starting, postponing idle close");
                if !wait_until_running(running, stops).await {
                    return;
                }
            }
            info!(
                service = %service.name,
                ttl_ms = ttl.as_millis() as u64,
                "Service idle TTL expired"
            );
            service.close().await;
        });

        state.ttl_timer = Some(TtlTimer { generation, task });
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("root_dir", &self.config.root_dir)
            .field("port", &self.port())
            .field("running", &self.is_running())
            .finish()
    }
}

/// `true` once the service runs, `false` if its process is stopped first
async fn wait_until_running(
    mut running: watch::Receiver<bool>,
    mut stops: watch::Receiver<u64>,
) -> bool {
    tokio::select! {
        ready = running.wait_for(|running| *running) => ready.is_ok(),
        _ = stops.changed() => false,
    }
}

/// SIGTERM, then SIGKILL once the grace period has passed
async fn terminate(service: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(service, pid, "Sending SIGTERM to service");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(service, %status, "Service process exited");
        }
        Ok(Err(e)) => {
            warn!(service, error = %e, "Error waiting for service to exit");
        }
        Err(_) => {
            warn!(
                service,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Relay child output lines into the log
async fn forward_output<R>(service: String, stream: OutputStream, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match stream {
                OutputStream::Stdout => info!(service = %service, "{}", line),
                OutputStream::Stderr => warn!(service = %service, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(service = %service, error = %e, "Stopped reading service output");
                break;
            }
        }
    }
}
