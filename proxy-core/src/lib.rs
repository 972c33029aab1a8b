//! Proxy Core Library
//!
//! Request-observing reverse proxy: every HTTP transaction passing through is
//! timed, captured into a bounded in-memory window, folded into rolling
//! statistics and published to registered listeners.

pub mod admin;
pub mod body;
pub mod forward;
pub mod handlers;
pub mod listener;
pub mod mock;
pub mod model;
/// Core proxy functionality modules
pub mod proxy;
pub mod stats;
pub mod traffic_log;

/// Configuration types and utilities
pub mod config;

/// Error types for proxy operations
pub mod error;

pub use admin::{dashboard_router, start_dashboard_server};
pub use config::{ProxyConfig, ServerMode};
pub use error::{BodyCaptureError, ProxyError, UpstreamError};
pub use handlers::ObservingProxy;
pub use listener::{FnListener, ListenerError, ListenerSet, TransactionListener};
pub use model::{ResponseRecord, StatsSnapshot, Transaction};
/// Re-export commonly used types
pub use proxy::{probe_port, wait_for_port, ProxyServer, RunningServer};
pub use stats::StatsTracker;
pub use traffic_log::TransactionLog;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
