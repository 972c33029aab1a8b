//! `tailscale serve` / `tailscale funnel` through the tailscale CLI.

use crate::{GatewayError, NetworkGateway, Result, ServiceInfo, ServiceRequest, DEFAULT_HTTPS_PORT};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const HTTPS_CAPABILITY: &str = "https";
const PORT_SEARCH_SPAN: u16 = 200;

/// Captured result of one CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs the tailscale binary with the given arguments.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Spawns a real process per call.
#[derive(Debug, Clone)]
pub struct SystemCommand {
    program: PathBuf,
    timeout: Duration,
}

impl SystemCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SystemCommand {
    fn default() -> Self {
        Self::new("tailscale")
    }
}

#[async_trait]
impl CommandRunner for SystemCommand {
    async fn run(&self, args: &[String]) -> std::io::Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{} did not finish within {:?}", self.program.display(), self.timeout),
                )
            })??;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Subset of `tailscale status --json`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub backend_state: String,
    #[serde(rename = "Self", default)]
    pub self_node: Option<SelfStatus>,
    #[serde(default)]
    pub cert_domains: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SelfStatus {
    #[serde(rename = "DNSName", default)]
    pub dns_name: String,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub cap_map: Option<HashMap<String, serde_json::Value>>,
}

impl NodeStatus {
    /// MagicDNS name without the trailing dot.
    pub fn dns_name(&self) -> Option<&str> {
        self.self_node
            .as_ref()
            .map(|s| s.dns_name.trim_end_matches('.'))
            .filter(|name| !name.is_empty())
    }

    pub fn has_https(&self) -> bool {
        let Some(node) = &self.self_node else {
            return false;
        };
        let listed = node
            .capabilities
            .as_ref()
            .map(|caps| caps.iter().any(|c| c == HTTPS_CAPABILITY))
            .unwrap_or(false);
        let mapped = node
            .cap_map
            .as_ref()
            .map(|caps| caps.contains_key(HTTPS_CAPABILITY))
            .unwrap_or(false);
        listed || mapped
    }

    /// Whether a certificate domain covers this node.
    pub fn has_cert_for(&self, dns_name: &str) -> bool {
        let node = dns_name.split('.').next().unwrap_or(dns_name);
        self.cert_domains
            .as_ref()
            .map(|domains| domains.iter().any(|d| d.contains(node)))
            .unwrap_or(false)
    }
}

/// Subset of `tailscale serve status --json`.
#[derive(Debug, Default, Deserialize)]
pub struct ServeStatus {
    #[serde(rename = "TCP", default)]
    pub tcp: HashMap<String, TcpHandler>,
    #[serde(rename = "Web", default)]
    pub web: HashMap<String, WebHandlers>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TcpHandler {
    #[serde(rename = "HTTPS", default)]
    pub https: bool,
    #[serde(rename = "TCPForward", default)]
    pub tcp_forward: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebHandlers {
    #[serde(rename = "Handlers", default)]
    pub handlers: HashMap<String, serde_json::Value>,
}

impl ServeStatus {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    /// A raw TCP forwarder owns the port.
    pub fn is_tcp_forwarding(&self, port: u16) -> bool {
        self.tcp
            .get(&port.to_string())
            .map(|h| !h.tcp_forward.is_empty())
            .unwrap_or(false)
    }

    fn web_port_in_use(&self, port: u16) -> bool {
        let suffix = format!(":{}", port);
        self.web.keys().any(|host_port| host_port.ends_with(&suffix))
    }

    pub fn has_handler(&self, host: &str, port: u16, mount_path: &str) -> bool {
        self.web
            .get(&format!("{}:{}", host, port))
            .map(|w| w.handlers.contains_key(mount_path))
            .unwrap_or(false)
    }

    pub fn is_port_free(&self, port: u16) -> bool {
        !self.is_tcp_forwarding(port) && !self.web_port_in_use(port)
    }
}

/// Gateway backed by the local tailscale daemon.
pub struct TailscaleCli {
    runner: Arc<dyn CommandRunner>,
    registered: Mutex<Vec<ServiceRequest>>,
}

impl TailscaleCli {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommand::default()))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn registered(&self) -> Vec<ServiceRequest> {
        self.registered.lock().clone()
    }

    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput> {
        let command = format!("tailscale {}", args.join(" "));
        debug!("Running {}", command);
        let output = self.runner.run(&args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(GatewayError::Command {
                command,
                status: output
                    .code
                    .map(|c| format!("exit status {}", c))
                    .unwrap_or_else(|| "terminated".to_string()),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let output = self
            .exec(vec!["status".into(), "--json".into()])
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        Ok(serde_json::from_str(&output.stdout)?)
    }

    pub async fn serve_status(&self) -> Result<ServeStatus> {
        let output = self
            .exec(vec!["serve".into(), "status".into(), "--json".into()])
            .await?;
        ServeStatus::parse(&output.stdout)
    }

    fn listener_args(request: &ServiceRequest) -> (String, String) {
        let verb = if request.want_public { "funnel" } else { "serve" };
        let port = request.effective_port();
        let flag = if request.want_tls {
            format!("--https={}", port)
        } else {
            format!("--http={}", port)
        };
        (verb.to_string(), flag)
    }
}

impl Default for TailscaleCli {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TailscaleCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailscaleCli")
            .field("registered", &self.registered.lock().len())
            .finish()
    }
}

#[async_trait]
impl NetworkGateway for TailscaleCli {
    fn name(&self) -> &str {
        "tailscale"
    }

    async fn is_available(&self) -> bool {
        match self.status().await {
            Ok(status) if status.backend_state.is_empty() || status.backend_state == "Running" => {
                info!("Tailscale daemon ready");
                true
            }
            Ok(status) => {
                info!("Tailscale daemon not running (state {})", status.backend_state);
                false
            }
            Err(e) => {
                info!("Tailscale not available: {}", e);
                false
            }
        }
    }

    async fn register_service(&self, request: &ServiceRequest) -> Result<ServiceInfo> {
        let request = request.normalized();
        let port = request.effective_port();

        if request.want_public && (!request.want_tls || port != DEFAULT_HTTPS_PORT) {
            return Err(GatewayError::FunnelRequiresHttps443);
        }

        let status = self.status().await?;
        let dns_name = status
            .dns_name()
            .ok_or_else(|| GatewayError::Unavailable("node has no DNS name".to_string()))?
            .to_string();

        let serve = self.serve_status().await?;
        if serve.is_tcp_forwarding(port) || serve.has_handler(&dns_name, port, &request.mount_path)
        {
            return Err(GatewayError::PortInUse(port));
        }

        if request.want_tls && !status.has_https() {
            if request.want_public {
                return Err(GatewayError::TlsNotProvisioned);
            }
            warn!("HTTPS capability not enabled for this tailnet, serve on port {} may not work", port);
        }
        if request.want_public && !status.has_cert_for(&dns_name) {
            return Err(GatewayError::CertificateUnavailable(dns_name));
        }

        let (verb, flag) = Self::listener_args(&request);
        self.exec(vec![
            verb,
            "--bg".into(),
            flag,
            format!("--set-path={}", request.mount_path),
            request.local_url(),
        ])
        .await?;

        let info = ServiceInfo::for_host(&dns_name, &request);
        if info.is_public {
            info!("Tailscale funnel configured, internet accessible at {}", info.url);
        } else {
            info!("Tailscale serve configured, tailnet accessible at {}", info.url);
        }
        self.registered.lock().push(request);
        Ok(info)
    }

    async fn unregister_service(&self, request: &ServiceRequest) -> Result<()> {
        let request = request.normalized();
        let (verb, flag) = Self::listener_args(&request);
        let result = self
            .exec(vec![
                verb,
                flag,
                format!("--set-path={}", request.mount_path),
                "off".into(),
            ])
            .await;
        self.registered.lock().retain(|r| *r != request);

        match result {
            Ok(_) => Ok(()),
            Err(GatewayError::Command { stderr, .. }) if is_already_gone(&stderr) => {
                debug!("Nothing served at {} {}", request.effective_port(), request.mount_path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn unregister_all(&self) -> Result<()> {
        info!("Clearing all Tailscale serve configurations");
        self.exec(vec!["serve".into(), "reset".into()]).await?;
        self.registered.lock().clear();
        Ok(())
    }

    async fn free_external_port(&self, start: u16) -> Result<u16> {
        let serve = self.serve_status().await?;
        let end = start.saturating_add(PORT_SEARCH_SPAN);
        (start..end)
            .find(|port| serve.is_port_free(*port))
            .ok_or_else(|| {
                GatewayError::Unavailable(format!(
                    "no free tailscale port between {} and {}",
                    start, end
                ))
            })
    }
}

fn is_already_gone(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("does not exist") || stderr.contains("not found") || stderr.contains("nothing")
}
