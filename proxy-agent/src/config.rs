//! Layered agent configuration: defaults < JSON file < `GATEWATCH_*`
//! environment < command line.

use crate::{AgentError, Args};
use proxy_core::{ProxyConfig, ServerMode};
use proxy_gateway::ServiceRequest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "GATEWATCH_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Local backend port; `None` in mock mode
    pub port: Option<u16>,
    pub mock: bool,
    pub funnel: bool,
    pub use_https: bool,
    pub serve_port: Option<u16>,
    pub set_path: String,
    pub verbose: bool,
    pub json: bool,
    pub log_file: Option<PathBuf>,
    pub no_tui: bool,
    pub no_ui: bool,
    pub ui_port: Option<u16>,
    pub local_only: bool,
    pub max_logs: usize,
    pub backend_timeout_secs: u64,
    pub forwarded_proto: String,
    /// Standalone tailnet identity options. Exposure goes through the local
    /// tailscale node, so these are rejected by `validate`.
    pub force_standalone: bool,
    pub auth_key: Option<String>,
    pub tailscale_name: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: None,
            mock: false,
            funnel: false,
            use_https: false,
            serve_port: None,
            set_path: "/".to_string(),
            verbose: false,
            json: false,
            log_file: None,
            no_tui: false,
            no_ui: false,
            ui_port: None,
            local_only: false,
            max_logs: proxy_core::config::DEFAULT_MAX_TRANSACTIONS,
            backend_timeout_secs: 30,
            forwarded_proto: "https".to_string(),
            force_standalone: false,
            auth_key: None,
            tailscale_name: None,
        }
    }
}

impl AgentConfig {
    /// Mock mode exposes a public endpoint unless asked to stay local, and a
    /// funnel always needs HTTPS.
    pub fn apply_auto_configuration(&mut self) {
        if self.mock && !self.funnel && !self.local_only {
            self.funnel = true;
        }
        if self.funnel {
            self.use_https = true;
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        match (self.mock, self.port) {
            (true, Some(_)) => {
                return Err(AgentError::Config(
                    "validation failed: cannot specify both a port and --mock".to_string(),
                ))
            }
            (false, None) => {
                return Err(AgentError::Config(
                    "validation failed: port argument is required (or use --mock)".to_string(),
                ))
            }
            (false, Some(0)) => {
                return Err(AgentError::Config(
                    "validation failed: port must be between 1 and 65535".to_string(),
                ))
            }
            _ => {}
        }
        if self.force_standalone || self.auth_key.is_some() || self.tailscale_name.is_some() {
            return Err(AgentError::Config(format!(
                "validation failed: a standalone tailnet node{} is not supported; \
                 services are exposed through this machine's tailscale node \
                 (drop --force-standalone, --auth-key and --tailscale-name)",
                self.tailscale_name
                    .as_deref()
                    .map(|name| format!(" ('{}')", name))
                    .unwrap_or_default()
            )));
        }
        if self.max_logs == 0 {
            return Err(AgentError::Config(
                "validation failed: max_logs must be greater than zero".to_string(),
            ));
        }
        if self.funnel && self.serve_port.map(|p| p != 443).unwrap_or(false) {
            return Err(AgentError::Config(
                "validation failed: funnel requires HTTPS on port 443".to_string(),
            ));
        }
        Ok(())
    }

    pub fn mode(&self) -> ServerMode {
        match self.port {
            Some(port) if !self.mock => ServerMode::local_proxy(port),
            _ => ServerMode::Mock,
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            mode: self.mode(),
            max_transactions: self.max_logs,
            backend_timeout_secs: self.backend_timeout_secs,
            forwarded_proto: self.forwarded_proto.clone(),
            ..Default::default()
        }
    }

    /// How the proxy itself is exposed.
    pub fn service_request(&self, proxy_port: u16) -> ServiceRequest {
        ServiceRequest {
            local_port: proxy_port,
            mount_path: self.set_path.clone(),
            want_public: self.funnel,
            want_tls: self.use_https,
            external_port: self.serve_port,
        }
        .normalized()
    }

    /// Whether the console dashboard owns stdout.
    pub fn console_dashboard(&self) -> bool {
        !self.no_tui
    }
}

/// Load from the process environment.
pub fn load_config(args: &Args) -> Result<AgentConfig, AgentError> {
    load_config_with_env(args, |key| std::env::var(key).ok())
}

/// Load with an explicit environment lookup.
pub fn load_config_with_env<F>(args: &Args, env: F) -> Result<AgentConfig, AgentError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &args.config {
        Some(path) => load_file(path)?,
        None => AgentConfig::default(),
    };
    apply_env(&mut config, &env)?;
    apply_args(&mut config, args);
    config.apply_auto_configuration();
    config.validate()?;
    Ok(config)
}

fn load_file(path: &Path) -> Result<AgentConfig, AgentError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AgentError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| AgentError::Config(format!("invalid config file {}: {}", path.display(), e)))
}

fn env_value<T, F>(env: &F, name: &str) -> Result<Option<T>, AgentError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match env(&key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AgentError::Config(format!("invalid value for {}: '{}'", key, raw))),
    }
}

fn apply_env<F>(config: &mut AgentConfig, env: &F) -> Result<(), AgentError>
where
    F: Fn(&str) -> Option<String>,
{
    let port: Option<u16> = env_value(env, "PORT")?;
    let mock: Option<bool> = env_value(env, "MOCK")?;
    match (port, mock) {
        (Some(port), mock) => override_mode(config, Some(port), mock.unwrap_or(false)),
        (None, Some(true)) => override_mode(config, None, true),
        (None, Some(false)) => config.mock = false,
        (None, None) => {}
    }
    if let Some(v) = env_value(env, "FUNNEL")? {
        config.funnel = v;
    }
    if let Some(v) = env_value(env, "HTTPS")? {
        config.use_https = v;
    }
    if let Some(v) = env_value(env, "SERVE_PORT")? {
        config.serve_port = Some(v);
    }
    if let Some(v) = env_value::<String, _>(env, "SET_PATH")? {
        config.set_path = v;
    }
    if let Some(v) = env_value(env, "VERBOSE")? {
        config.verbose = v;
    }
    if let Some(v) = env_value(env, "JSON")? {
        config.json = v;
    }
    if let Some(v) = env_value::<PathBuf, _>(env, "LOG_FILE")? {
        config.log_file = Some(v);
    }
    if let Some(v) = env_value(env, "NO_TUI")? {
        config.no_tui = v;
    }
    if let Some(v) = env_value(env, "NO_UI")? {
        config.no_ui = v;
    }
    if let Some(v) = env_value(env, "UI_PORT")? {
        config.ui_port = Some(v);
    }
    if let Some(v) = env_value(env, "LOCAL_ONLY")? {
        config.local_only = v;
    }
    if let Some(v) = env_value(env, "MAX_LOGS")? {
        config.max_logs = v;
    }
    if let Some(v) = env_value(env, "BACKEND_TIMEOUT")? {
        config.backend_timeout_secs = v;
    }
    if let Some(v) = env_value::<String, _>(env, "FORWARDED_PROTO")? {
        config.forwarded_proto = v;
    }
    Ok(())
}

/// A layer that names a port or mock mode replaces the mode chosen by the
/// layers below it. Naming both is left for `validate` to reject.
fn override_mode(config: &mut AgentConfig, port: Option<u16>, mock: bool) {
    match (port, mock) {
        (Some(port), mock) => {
            config.port = Some(port);
            config.mock = mock;
        }
        (None, true) => {
            config.port = None;
            config.mock = true;
        }
        (None, false) => {}
    }
}

fn apply_args(config: &mut AgentConfig, args: &Args) {
    override_mode(config, args.port, args.mock);
    config.funnel |= args.funnel;
    config.use_https |= args.use_https;
    config.verbose |= args.verbose;
    config.json |= args.json;
    config.no_tui |= args.no_tui;
    config.no_ui |= args.no_ui;
    config.local_only |= args.local_only;
    if args.serve_port.is_some() {
        config.serve_port = args.serve_port;
    }
    if let Some(path) = &args.set_path {
        config.set_path = path.clone();
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file.clone();
    }
    if args.ui_port.is_some() {
        config.ui_port = args.ui_port;
    }
    if let Some(max) = args.max_logs {
        config.max_logs = max;
    }
    if let Some(secs) = args.backend_timeout {
        config.backend_timeout_secs = secs;
    }
    config.force_standalone |= args.force_standalone;
    if args.auth_key.is_some() {
        config.auth_key = args.auth_key.clone();
    }
    if args.tailscale_name.is_some() {
        config.tailscale_name = args.tailscale_name.clone();
    }
}
