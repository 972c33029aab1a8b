//! Backend forwarding for proxy mode.

use crate::error::UpstreamError;
use axum::body::Body;
use http::header::{self, HeaderMap, HeaderName, HeaderValue, HOST};
use http::{request, Request, Response, Uri, Version};
use http_body::Body as _;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to a single backend authority over plain HTTP/1.1.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    target: String,
    forwarded_proto: HeaderValue,
    timeout: Option<Duration>,
}

impl Forwarder {
    pub fn new(target: impl Into<String>, forwarded_proto: &str, timeout: Option<Duration>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            target: target.into(),
            forwarded_proto: HeaderValue::from_str(forwarded_proto)
                .unwrap_or_else(|_| HeaderValue::from_static("https")),
            timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Send the request to the backend and return its response with the body
    /// still streaming. One attempt, no retry.
    pub async fn forward(
        &self,
        parts: &request::Parts,
        body: Body,
        remote_addr: SocketAddr,
    ) -> Result<Response<Body>, UpstreamError> {
        let request = self.build_request(parts, body, remote_addr)?;

        let pending = self.client.request(request);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| UpstreamError::Timeout(limit))?,
            None => pending.await,
        };
        let response: Response<hyper::body::Incoming> =
            result.map_err(|e| UpstreamError::Unreachable(describe(&e)))?;

        let (mut parts, incoming) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(incoming)))
    }

    fn build_request(
        &self,
        parts: &request::Parts,
        body: Body,
        remote_addr: SocketAddr,
    ) -> Result<Request<Body>, UpstreamError> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://{}{}", self.target, path_and_query)
            .parse()
            .map_err(|e: http::uri::InvalidUri| UpstreamError::InvalidRequest(e.to_string()))?;

        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);

        let host = HeaderValue::from_str(&self.target)
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
        headers.insert(HOST, host);
        headers.insert(
            HeaderName::from_static(X_FORWARDED_PROTO),
            self.forwarded_proto.clone(),
        );
        if let Some(original_host) = original_host {
            headers.insert(HeaderName::from_static(X_FORWARDED_HOST), original_host);
        }
        append_forwarded_for(&mut headers, remote_addr);

        // the replayed body may be shorter than what the client declared
        headers.remove(header::CONTENT_LENGTH);
        if let Some(len) = body.size_hint().exact() {
            if len > 0 || parts.headers.contains_key(header::CONTENT_LENGTH) {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }

        let mut request = Request::new(body);
        *request.method_mut() = parts.method.clone();
        *request.uri_mut() = uri;
        *request.version_mut() = Version::HTTP_11;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote_addr: SocketAddr) {
    let client_ip = remote_addr.ip().to_string();
    let value = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
}

fn describe(err: &hyper_util::client::legacy::Error) -> String {
    match std::error::Error::source(err) {
        Some(source) => format!("{}: {}", err, source),
        None => err.to_string(),
    }
}

/// Plain-text response sent to the client when the backend fails.
pub fn upstream_error_response(err: &UpstreamError) -> Response<Body> {
    let status = err.status_code();
    let reason = status.canonical_reason().unwrap_or("Upstream Error");
    let mut response = Response::new(Body::from(format!("{}\n", reason)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
