use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("port {0} is already serving TCP")]
    PortInUse(u16),

    #[error("HTTPS certificates are not enabled for this tailnet")]
    TlsNotProvisioned,

    #[error("certificate not available: {0}")]
    CertificateUnavailable(String),

    #[error("funnel requires HTTPS on port 443")]
    FunnelRequiresHttps443,

    #[error("network gateway unavailable: {0}")]
    Unavailable(String),

    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to parse gateway output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Failures that mean the gateway cannot be used at all, as opposed to a
    /// rejected registration.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Io(_))
    }
}
