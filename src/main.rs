use clap::{Parser, Subcommand};
use microproxy::config::{Config, DEFAULT_CONFIG_FILE};
use microproxy::proxy::{DispatchSettings, ProxyServer};
use microproxy::router::Router;
use microproxy::service::{LaunchSettings, Service};
use microproxy::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "microproxy", version, about = "Route one local port to many services")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy in development mode
    Dev {
        /// Only serve these services (all when omitted)
        names: Vec<String>,

        /// Named environment applied on top of each service's env
        #[arg(long)]
        env: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("microproxy=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Dev { names, env } => run_dev(&cli.config, names, env).await,
    }
}

async fn run_dev(config_path: &Path, names: Vec<String>, env: Option<String>) -> anyhow::Result<()> {
    let config = Config::load(config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let settings = Arc::new(LaunchSettings {
        worker: config.worker_command()?,
        env_name: env.clone(),
        shutdown_grace_period: config.shutdown_grace_period(),
    });
    let services = select_services(
        Service::create_all(config.services.clone(), settings),
        &names,
    )?;

    let router = Router::new(services, config.port);
    router.assign_ports().await?;
    router.load().await?;
    if let Err(e) = router.watch() {
        warn!(error = %e, "Failed to watch pages, routes will not reload automatically");
    }

    print_startup_banner(&config, &router, env.as_deref());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let server = ProxyServer::bind(
        addr,
        Arc::clone(&router),
        DispatchSettings {
            dev_mode: true,
            autostart: config.autostart,
        },
        shutdown_rx,
    )
    .await?;

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown(&router).await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping all services...");
    router.close_services().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;
    info!("Shutdown complete");
    Ok(())
}

/// Keep services whose name was requested, in configuration order
fn select_services(services: Vec<Arc<Service>>, names: &[String]) -> anyhow::Result<Vec<Arc<Service>>> {
    if names.is_empty() {
        return Ok(services);
    }

    let unknown: Vec<&str> = names
        .iter()
        .filter(|name| !services.iter().any(|s| s.name() == name.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        anyhow::bail!("Unknown services: {}", unknown.join(", "));
    }

    Ok(services
        .into_iter()
        .filter(|s| names.iter().any(|name| name == s.name()))
        .collect())
}

/// Wait for Ctrl+C or SIGTERM. SIGHUP reloads the route table.
async fn wait_for_shutdown(router: &Arc<Router>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading routes...");
                    match router.load().await {
                        Ok(()) => info!(routes = router.routes().len(), "Routes reloaded"),
                        Err(e) => error!(error = %e, "Failed to reload routes"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = router;
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config, router: &Router, env: Option<&str>) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        port = config.port,
        autostart = config.autostart,
        env,
        worker = %config.worker,
        "Server configuration"
    );

    for service in router.services() {
        let summary = service.summary();
        info!(
            id = summary.id,
            name = %summary.name,
            version = %summary.version,
            port = summary.port,
            framework = summary.framework,
            root_dir = %service.root_dir().display(),
            "Service configured"
        );
    }

    info!(routes = router.routes().len(), "Routes loaded");
    for route in router.routes().iter() {
        info!(
            pattern = %route.pattern().as_str(),
            service = %route.service().name(),
            "Route"
        );
    }
}
