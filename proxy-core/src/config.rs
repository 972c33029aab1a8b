//! Configuration types and utilities

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request bodies with a declared length at or above this are never captured.
pub const DEFAULT_BODY_CAPTURE_LIMIT: usize = 10 * 1024 * 1024;

/// Number of transactions kept for inspection.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 1000;

/// What the observing handler does with a request once it has been captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ServerMode {
    /// Forward to a backend at `target` (`host:port`)
    Proxy { target: String },
    /// Answer every request with a synthetic JSON acknowledgment
    Mock,
}

impl ServerMode {
    /// Proxy mode towards a local port
    pub fn local_proxy(port: u16) -> Self {
        ServerMode::Proxy {
            target: format!("localhost:{}", port),
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, ServerMode::Mock)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::Proxy { .. } => "proxy",
            ServerMode::Mock => "mock",
        }
    }

    /// Human readable description of where requests end up
    pub fn target_description(&self) -> String {
        match self {
            ServerMode::Proxy { target } => format!("http://{}", target),
            ServerMode::Mock => "mock testing mode (no backing server)".to_string(),
        }
    }
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static configuration of the observing proxy.
/// Set once at construction and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Proxy or mock
    pub mode: ServerMode,
    /// Capacity of the recent-transaction ring
    pub max_transactions: usize,
    /// Declared request lengths below this are captured in full
    pub body_capture_limit: usize,
    /// Seconds to wait for the backend; 0 waits indefinitely
    pub backend_timeout_secs: u64,
    /// Value of `X-Forwarded-Proto` on forwarded requests
    pub forwarded_proto: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            mode: ServerMode::Mock,
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
            body_capture_limit: DEFAULT_BODY_CAPTURE_LIMIT,
            backend_timeout_secs: 30,
            forwarded_proto: "https".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn mock() -> Self {
        Self::default()
    }

    pub fn proxy(target: impl Into<String>) -> Self {
        Self {
            mode: ServerMode::Proxy {
                target: target.into(),
            },
            ..Default::default()
        }
    }

    pub fn backend_timeout(&self) -> Option<Duration> {
        match self.backend_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_transactions == 0 {
            return Err(ProxyError::Configuration(
                "validation failed: max_transactions must be greater than zero".to_string(),
            ));
        }
        if self.body_capture_limit == 0 {
            return Err(ProxyError::Configuration(
                "validation failed: body_capture_limit must be greater than zero".to_string(),
            ));
        }
        if let ServerMode::Proxy { target } = &self.mode {
            if target.is_empty() || target.parse::<http::uri::Authority>().is_err() {
                return Err(ProxyError::Configuration(format!(
                    "validation failed: invalid backend target '{}'",
                    target
                )));
            }
        }
        Ok(())
    }
}
