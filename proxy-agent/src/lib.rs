//! gatewatch agent
//!
//! Runs the observing proxy in front of a local backend (or in mock mode),
//! exposes it through the network gateway and shows traffic on the terminal.

use clap::Parser;
use proxy_core::{probe_port, wait_for_port, ProxyError, ProxyServer, RunningServer};
use proxy_gateway::{
    GatewayError, LocalGateway, NetworkGateway, ServiceInfo, ServiceRequest, TailscaleCli,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod config;
pub mod console;
pub mod logging;


use config::{load_config, AgentConfig};
use logging::{init_logging, LoggingConfig};

const BACKEND_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(10);
const DASHBOARD_MOUNT: &str = "/ui/";
const DASHBOARD_EXTERNAL_PORT: u16 = 8080;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "gatewatch", author, version, about = "Expose a local service and watch its traffic", long_about = None)]
pub struct Args {
    /// Local port of the backend to proxy
    pub port: Option<u16>,

    /// Answer every request with a JSON acknowledgement instead of proxying
    #[arg(short, long)]
    pub mock: bool,

    /// Expose publicly through a tailscale funnel
    #[arg(short, long)]
    pub funnel: bool,

    /// Serve over HTTPS on the tailnet
    #[arg(long = "https")]
    pub use_https: bool,

    /// External port to serve on (default 443 with HTTPS, 80 without)
    #[arg(long)]
    pub serve_port: Option<u16>,

    /// Path prefix to mount the service under
    #[arg(long)]
    pub set_path: Option<String>,

    #[arg(short, long)]
    pub verbose: bool,

    /// Log as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Write logs to this file (rotated daily)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Do not print transactions to the terminal
    #[arg(long)]
    pub no_tui: bool,

    /// Do not start the dashboard API
    #[arg(long)]
    pub no_ui: bool,

    /// Local port for the dashboard API (default: ephemeral)
    #[arg(long)]
    pub ui_port: Option<u16>,

    /// Never expose anything beyond this machine
    #[arg(long)]
    pub local_only: bool,

    /// Run as a separate tailnet node instead of this machine's (unsupported)
    #[arg(long)]
    pub force_standalone: bool,

    /// Auth key for a separate tailnet node (unsupported)
    #[arg(long)]
    pub auth_key: Option<String>,

    /// Name for a separate tailnet node (unsupported)
    #[arg(short = 'n', long)]
    pub tailscale_name: Option<String>,

    /// Remove all serve/funnel configuration and exit
    #[arg(long)]
    pub cleanup_serve: bool,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of transactions kept in memory
    #[arg(long)]
    pub max_logs: Option<usize>,

    /// Seconds to wait for the backend (0 disables the timeout)
    #[arg(long)]
    pub backend_timeout: Option<u64>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend on port {port} is not reachable: {reason}")]
    BackendUnreachable { port: u16, reason: String },

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything started so far, torn down in reverse on exit.
struct Session {
    gateway: Arc<dyn NetworkGateway>,
    proxy: Option<RunningServer>,
    dashboard: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    console: Option<JoinHandle<()>>,
    console_shutdown: watch::Sender<bool>,
    registered: Vec<ServiceRequest>,
}

impl Session {
    fn new(gateway: Arc<dyn NetworkGateway>) -> Self {
        let (console_shutdown, _) = watch::channel(false);
        Self {
            gateway,
            proxy: None,
            dashboard: None,
            console: None,
            console_shutdown,
            registered: Vec::new(),
        }
    }

    async fn register(&mut self, request: ServiceRequest) -> Result<ServiceInfo, GatewayError> {
        let info = self.gateway.register_service(&request).await?;
        self.registered.push(request);
        Ok(info)
    }

    async fn cleanup(mut self) {
        if !self.registered.is_empty() {
            if let Err(e) = self.gateway.unregister_all().await {
                tracing::warn!("Bulk unregister failed ({}), removing services one by one", e);
                for request in &self.registered {
                    if let Err(e) = self.gateway.unregister_service(request).await {
                        tracing::error!(
                            "Failed to unregister {} on port {}: {}",
                            request.mount_path,
                            request.local_port,
                            e
                        );
                    }
                }
            }
            self.registered.clear();
        }

        let _ = self.console_shutdown.send(true);
        if let Some(console) = self.console.take() {
            let _ = console.await;
        }
        if let Some((tx, task)) = self.dashboard.take() {
            let _ = tx.send(true);
            if let Err(e) = task.await {
                tracing::error!("Dashboard task failed: {}", e);
            }
        }
        if let Some(proxy) = self.proxy.take() {
            proxy.shutdown().await;
        }
        tracing::info!("Shutdown complete");
    }
}

/// Tailscale unless asked to stay local or the CLI is missing.
async fn select_gateway(config: &AgentConfig) -> Arc<dyn NetworkGateway> {
    if config.local_only {
        return Arc::new(LocalGateway::new());
    }
    let tailscale = TailscaleCli::new();
    if tailscale.is_available().await {
        Arc::new(tailscale)
    } else {
        tracing::warn!("tailscale is not available, serving on this machine only");
        Arc::new(LocalGateway::new())
    }
}

pub async fn run(args: Args) -> Result<(), AgentError> {
    if args.cleanup_serve {
        let _log = init_logging(&LoggingConfig {
            verbose: args.verbose,
            json: args.json,
            log_file: args.log_file.clone(),
            console_dashboard: false,
        })?;
        let gateway = TailscaleCli::new();
        gateway.unregister_all().await?;
        println!("Removed all serve and funnel configuration");
        return Ok(());
    }

    let config = load_config(&args)?;
    let _log = init_logging(&LoggingConfig {
        verbose: config.verbose,
        json: config.json,
        log_file: config.log_file.clone(),
        console_dashboard: config.console_dashboard(),
    })?;

    let gateway = select_gateway(&config).await;
    tracing::info!("Using {} gateway", gateway.name());

    let session = start(&config, Session::new(gateway)).await?;

    wait_for_signal().await;
    tracing::info!("Shutdown signal received, cleaning up...");
    session.cleanup().await;
    Ok(())
}

/// Bring up the proxy, dashboard and console. On a fatal error everything
/// already started is torn down before the error is returned.
pub(crate) async fn start(
    config: &AgentConfig,
    mut session: Session,
) -> Result<Session, AgentError> {
    match start_inner(config, &mut session).await {
        Ok(()) => Ok(session),
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            session.cleanup().await;
            Err(e)
        }
    }
}

async fn start_inner(config: &AgentConfig, session: &mut Session) -> Result<(), AgentError> {
    if let Some(port) = config.port.filter(|_| !config.mock) {
        let backend = SocketAddr::from(([127, 0, 0, 1], port));
        probe_port(backend, BACKEND_PROBE_TIMEOUT)
            .await
            .map_err(|e| AgentError::BackendUnreachable {
                port,
                reason: e.to_string(),
            })?;
    }

    let server = ProxyServer::bind(config.proxy_config()).await?;
    let proxy_addr = server.local_addr();
    let proxy = server.proxy().clone();
    session.proxy = Some(server.spawn());
    wait_for_port(proxy_addr, READY_TIMEOUT).await?;

    if !config.no_ui {
        if let Err(e) = start_dashboard(config, session, proxy.clone()).await {
            tracing::warn!("Dashboard unavailable: {}", e);
        }
    }

    let info = session.register(config.service_request(proxy_addr.port())).await?;
    print_banner(config, &info);

    if config.console_dashboard() {
        session.console = Some(console::spawn_console(
            &proxy,
            STATS_INTERVAL,
            session.console_shutdown.subscribe(),
        ));
    }
    Ok(())
}

async fn start_dashboard(
    config: &AgentConfig,
    session: &mut Session,
    proxy: proxy_core::ObservingProxy,
) -> Result<(), AgentError> {
    let listener = TcpListener::bind(("127.0.0.1", config.ui_port.unwrap_or(0))).await?;
    let addr = listener.local_addr()?;

    let (tx, mut rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let shutdown = async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if let Err(e) = proxy_core::start_dashboard_server(listener, proxy, shutdown).await {
            tracing::error!("Dashboard server failed: {}", e);
        }
    });
    session.dashboard = Some((tx, task));
    wait_for_port(addr, READY_TIMEOUT).await?;

    let external_port = session
        .gateway
        .free_external_port(DASHBOARD_EXTERNAL_PORT)
        .await?;
    let request = ServiceRequest {
        mount_path: DASHBOARD_MOUNT.to_string(),
        external_port: Some(external_port),
        ..ServiceRequest::new(addr.port())
    };
    let info = session.register(request).await?;
    tracing::info!("Dashboard API available at {}", info.url);
    if !config.no_tui {
        println!("Dashboard: {}", info.url);
    }
    Ok(())
}

fn print_banner(config: &AgentConfig, info: &ServiceInfo) {
    let target = match config.port {
        Some(port) if !config.mock => format!("http://127.0.0.1:{}", port),
        _ => "mock responder".to_string(),
    };
    let exposure = if info.is_public {
        "public (funnel)"
    } else {
        "tailnet only"
    };
    tracing::info!("Serving {} at {} ({})", target, info.url, exposure);
    println!("gatewatch: {} -> {} [{}]", info.url, target, exposure);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
