//! Exposure of local HTTP services on an overlay network.
//!
//! A [`NetworkGateway`] maps a local port onto a URL reachable from the
//! tailnet (or the public internet through a funnel). [`TailscaleCli`] drives
//! the `tailscale` binary; [`LocalGateway`] exposes nothing and just reports
//! local URLs.

pub mod error;
pub mod local;
pub mod tailscale;

pub use error::GatewayError;
pub use local::LocalGateway;
pub use tailscale::{CommandOutput, CommandRunner, SystemCommand, TailscaleCli};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, GatewayError>;

pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_HTTP_PORT: u16 = 80;

#[async_trait]
pub trait NetworkGateway: Send + Sync {
    /// Short name for logs ("tailscale", "local")
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn register_service(&self, request: &ServiceRequest) -> Result<ServiceInfo>;

    /// Remove one registration. Succeeds when it is already gone.
    async fn unregister_service(&self, request: &ServiceRequest) -> Result<()>;

    /// Remove every registration. Succeeds when there is none.
    async fn unregister_all(&self) -> Result<()>;

    /// First external port at or after `start` with nothing served on it.
    async fn free_external_port(&self, start: u16) -> Result<u16> {
        Ok(start)
    }
}

/// What to expose and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub local_port: u16,
    pub mount_path: String,
    pub want_public: bool,
    pub want_tls: bool,
    pub external_port: Option<u16>,
}

impl ServiceRequest {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            mount_path: "/".to_string(),
            want_public: false,
            want_tls: false,
            external_port: None,
        }
    }

    /// Apply defaults: mount path `/` with a leading slash, funnel forces TLS,
    /// an explicit 443 implies TLS, external port 443 with TLS and 80
    /// without.
    pub fn normalized(&self) -> ServiceRequest {
        let mount_path = if self.mount_path.is_empty() {
            "/".to_string()
        } else if self.mount_path.starts_with('/') {
            self.mount_path.clone()
        } else {
            format!("/{}", self.mount_path)
        };
        let want_tls = self.want_tls
            || self.want_public
            || self.external_port == Some(DEFAULT_HTTPS_PORT);
        let external_port = self.external_port.unwrap_or(if want_tls {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        });
        ServiceRequest {
            local_port: self.local_port,
            mount_path,
            want_public: self.want_public,
            want_tls,
            external_port: Some(external_port),
        }
    }

    /// External port after normalization.
    pub fn effective_port(&self) -> u16 {
        self.normalized()
            .external_port
            .unwrap_or(DEFAULT_HTTP_PORT)
    }

    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }
}

/// Where a registered service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub url: String,
    pub is_public: bool,
    pub is_tls: bool,
    pub local_url: String,
    pub external_port: u16,
    pub mount_path: String,
}

impl ServiceInfo {
    /// Describe `request` as served from `host`.
    pub fn for_host(host: &str, request: &ServiceRequest) -> Self {
        let request = request.normalized();
        let external_port = request.effective_port();
        Self {
            url: service_url(host, request.want_tls, external_port, &request.mount_path),
            is_public: request.want_public,
            is_tls: request.want_tls,
            local_url: request.local_url(),
            external_port,
            mount_path: request.mount_path,
        }
    }
}

/// `scheme://host[:port]path`, omitting the port when it is the scheme's
/// default.
pub fn service_url(host: &str, tls: bool, port: u16, mount_path: &str) -> String {
    let (scheme, default_port) = if tls {
        ("https", DEFAULT_HTTPS_PORT)
    } else {
        ("http", DEFAULT_HTTP_PORT)
    };
    if port == default_port {
        format!("{}://{}{}", scheme, host, mount_path)
    } else {
        format!("{}://{}:{}{}", scheme, host, port, mount_path)
    }
}
