//! Error types for proxy operations

use std::fmt;

/// Main error type for proxy operations
#[derive(Debug)]
pub enum ProxyError {
    /// Network-related errors (bind, accept, serve)
    Network(String),
    /// Configuration errors
    Configuration(String),
    /// Backend forwarding errors
    Upstream(UpstreamError),
    /// General I/O errors
    Io(std::io::Error),
    /// Body capture errors
    BodyCapture(BodyCaptureError),
}

/// Why a request body was not captured.
///
/// None of these abort the request; the handler forwards whatever it can and
/// records an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyCaptureError {
    /// Declared content length is at or above the capture cap
    DeclaredTooLarge(u64),
    /// Body without a declared length grew past the capture cap
    SizeLimitExceeded(usize),
    /// Error reading from the request body stream
    StreamReadError(String),
}

/// Failure talking to the configured backend
#[derive(Debug)]
pub enum UpstreamError {
    /// Could not connect or the exchange failed
    Unreachable(String),
    /// No response within the configured backend timeout
    Timeout(std::time::Duration),
    /// The forwarded request could not be built
    InvalidRequest(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Network(msg) => write!(f, "Network error: {}", msg),
            ProxyError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ProxyError::Upstream(err) => write!(f, "Upstream error: {}", err),
            ProxyError::Io(err) => write!(f, "I/O error: {}", err),
            ProxyError::BodyCapture(err) => write!(f, "Body capture error: {}", err),
        }
    }
}

impl fmt::Display for BodyCaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyCaptureError::DeclaredTooLarge(len) => {
                write!(f, "Declared content length {} exceeds capture limit", len)
            }
            BodyCaptureError::SizeLimitExceeded(size) => {
                write!(f, "Size limit exceeded: {} bytes", size)
            }
            BodyCaptureError::StreamReadError(msg) => write!(f, "Stream read error: {}", msg),
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Unreachable(msg) => write!(f, "backend unreachable: {}", msg),
            UpstreamError::Timeout(after) => write!(f, "backend timed out after {:?}", after),
            UpstreamError::InvalidRequest(msg) => write!(f, "invalid upstream request: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(err) => Some(err),
            ProxyError::Upstream(err) => Some(err),
            ProxyError::BodyCapture(err) => Some(err),
            _ => None,
        }
    }
}

impl std::error::Error for BodyCaptureError {}

impl std::error::Error for UpstreamError {}

impl UpstreamError {
    /// Status returned to the original caller for this failure
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            UpstreamError::Timeout(_) => http::StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Unreachable(_) | UpstreamError::InvalidRequest(_) => {
                http::StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<BodyCaptureError> for ProxyError {
    fn from(err: BodyCaptureError) -> Self {
        ProxyError::BodyCapture(err)
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        ProxyError::Upstream(err)
    }
}
