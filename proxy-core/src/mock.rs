//! Synthetic acknowledgment used when there is no backend.

use axum::body::Body;
use chrono::{SecondsFormat, Utc};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use http::{request, Response, StatusCode};
use serde::Serialize;

pub const MODE_HEADER: &str = "x-gatewatch-mode";
pub const TIMESTAMP_HEADER: &str = "x-gatewatch-timestamp";

#[derive(Debug, Serialize)]
pub struct MockAck<'a> {
    pub status: &'static str,
    pub timestamp: String,
    pub method: &'a str,
    pub path: &'a str,
    /// Distinct request header names, `Host` not counted
    pub headers: usize,
    pub body_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<&'a str>,
}

impl<'a> MockAck<'a> {
    pub fn from_request(parts: &'a request::Parts, body_size: usize) -> Self {
        let headers = parts.headers.keys().filter(|name| **name != HOST).count();
        Self {
            status: "received",
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            method: parts.method.as_str(),
            path: parts.uri.path(),
            headers,
            body_size,
            query: parts.uri.query().filter(|q| !q.is_empty()),
            content_type: parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Build the mock response. Never touches the network.
pub fn respond(parts: &request::Parts, body_size: usize) -> Response<Body> {
    let ack = MockAck::from_request(parts, body_size);
    let mut payload = serde_json::to_vec(&ack).unwrap_or_else(|_| b"{}".to_vec());
    payload.push(b'\n');

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(MODE_HEADER),
        HeaderValue::from_static("mock"),
    );
    if let Ok(value) = HeaderValue::from_str(&ack.timestamp) {
        headers.insert(HeaderName::from_static(TIMESTAMP_HEADER), value);
    }
    response
}
