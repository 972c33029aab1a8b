use crate::body::{self, ObservedBody};
use crate::config::{ProxyConfig, ServerMode};
use crate::forward::{upstream_error_response, Forwarder};
use crate::listener::{FnListener, ListenerSet, TransactionListener};
use crate::mock;
use crate::model::{join_headers, RequestIdGenerator, ResponseRecord, StatsSnapshot, Transaction};
use crate::stats::StatsTracker;
use crate::traffic_log::TransactionLog;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::Router;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Method, Response, StatusCode};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

struct Shared {
    config: ProxyConfig,
    forwarder: Option<Forwarder>,
    stats: StatsTracker,
    log: TransactionLog,
    listeners: ListenerSet,
    ids: RequestIdGenerator,
}

/// Request-observing handler.
///
/// Every request is timed, captured, answered according to the configured
/// [`ServerMode`], recorded in the transaction ring and published to the
/// registered listeners once the response has been written. Clones share the
/// same state.
#[derive(Clone)]
pub struct ObservingProxy {
    shared: Arc<Shared>,
}

impl ObservingProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let forwarder = match &config.mode {
            ServerMode::Proxy { target } => Some(Forwarder::new(
                target.clone(),
                &config.forwarded_proto,
                config.backend_timeout(),
            )),
            ServerMode::Mock => None,
        };
        Self {
            shared: Arc::new(Shared {
                log: TransactionLog::new(config.max_transactions),
                forwarder,
                stats: StatsTracker::new(),
                listeners: ListenerSet::new(),
                ids: RequestIdGenerator::new(),
                config,
            }),
        }
    }

    pub fn mode(&self) -> &ServerMode {
        &self.shared.config.mode
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.shared.listeners.add(listener);
    }

    pub fn add_listener_fn<F>(&self, name: &str, func: F)
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .add(Arc::new(FnListener::new(name, func)));
    }

    /// Copy of the transaction ring, oldest first.
    pub fn recent_transactions(&self) -> Vec<Transaction> {
        self.shared.log.snapshot()
    }

    pub fn transaction_count(&self) -> usize {
        self.shared.log.len()
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.shared.stats
    }

    /// Drop recorded transactions and statistics. In-flight requests keep
    /// their own bookkeeping.
    pub fn reset(&self) {
        self.shared.log.clear();
        self.shared.stats.reset();
    }

    /// Router sending every method and path to [`ObservingProxy::handle`].
    pub fn router(&self) -> Router {
        let proxy = self.clone();
        Router::new().fallback(
            move |connect: Option<ConnectInfo<SocketAddr>>, request: Request| {
                let proxy = proxy.clone();
                async move {
                    let remote_addr = connect
                        .map(|ConnectInfo(addr)| addr)
                        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                    proxy.handle(request, remote_addr).await
                }
            },
        )
    }

    /// Observe one request and produce its response.
    ///
    /// The returned body reports back when it has been fully written (or
    /// dropped), which is when the transaction is recorded.
    pub async fn handle(&self, request: Request, remote_addr: SocketAddr) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let declared_len = declared_length(&parts.headers);
        let request_id = self.shared.ids.next_id();

        info!(
            request_id = %request_id,
            method = %parts.method,
            url = %url,
            remote_addr = %remote_addr,
            content_length = declared_len.map(|l| l as i64).unwrap_or(-1),
            "Incoming request"
        );

        let record = RequestRecord {
            id: request_id.clone(),
            timestamp: Utc::now(),
            method: parts.method.to_string(),
            url,
            remote_addr: remote_addr.to_string(),
            headers: join_headers(&parts.headers),
            body: String::new(),
            user_agent: header_text(&parts.headers, USER_AGENT),
            content_type: header_text(&parts.headers, CONTENT_TYPE),
            size: declared_len.map(|l| l as i64).unwrap_or(-1),
        };
        let mut guard = InFlightGuard::enter(self.shared.clone(), record);

        let captured =
            body::capture(body, declared_len, self.shared.config.body_capture_limit).await;
        if let Some(reason) = &captured.skipped {
            debug!(request_id = %request_id, "Request body not captured: {}", reason);
        }
        guard.set_body(captured.text());

        let response = match &self.shared.forwarder {
            None => mock::respond(&parts, captured.captured.len()),
            Some(forwarder) => {
                match forwarder
                    .forward(&parts, captured.forward, remote_addr)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(
                            request_id = %request_id,
                            target = forwarder.target(),
                            "Backend request failed: {}",
                            e
                        );
                        upstream_error_response(&e)
                    }
                }
            }
        };

        let (response_parts, response_body) = response.into_parts();
        let status = response_parts.status;
        let pending = PendingTransaction {
            guard,
            status_code: status.as_u16(),
            response_headers: join_headers(&response_parts.headers),
            body_less: parts.method == Method::HEAD
                || status.is_informational()
                || status == StatusCode::NO_CONTENT
                || status == StatusCode::NOT_MODIFIED,
        };
        let observed = ObservedBody::new(response_body, move |written, aborted| {
            pending.complete(written, aborted)
        });
        Response::from_parts(response_parts, observed.into_body())
    }
}

impl std::fmt::Debug for ObservingProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservingProxy")
            .field("mode", &self.shared.config.mode)
            .field("listeners", &self.shared.listeners)
            .finish()
    }
}

/// Status recorded for a request whose client went away before a response
/// existed.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Owns the open-connection decrement and the pending record for one
/// request.
///
/// Finished exactly once: with the response outcome when its body is done,
/// or by `Drop` as an aborted transaction when the handler future is
/// cancelled or unwinds.
struct InFlightGuard {
    shared: Arc<Shared>,
    started: Instant,
    record: Option<RequestRecord>,
}

impl InFlightGuard {
    fn enter(shared: Arc<Shared>, record: RequestRecord) -> Self {
        shared.stats.increment_open();
        Self {
            shared,
            started: Instant::now(),
            record: Some(record),
        }
    }

    fn set_body(&mut self, body: String) {
        if let Some(record) = self.record.as_mut() {
            record.body = body;
        }
    }

    fn finish(
        &mut self,
        status_code: u16,
        response_headers: HashMap<String, String>,
        written: u64,
        aborted: bool,
    ) {
        let Some(record) = self.record.take() else {
            return;
        };
        let duration = self.started.elapsed();
        self.shared.stats.record_sample(duration);
        self.shared.stats.decrement_open();

        let txn = Transaction {
            id: record.id,
            timestamp: record.timestamp,
            method: record.method,
            url: record.url,
            remote_addr: record.remote_addr,
            headers: record.headers,
            body: record.body,
            response: ResponseRecord {
                status_code,
                headers: response_headers,
                size: written,
            },
            duration,
            user_agent: record.user_agent,
            content_type: record.content_type,
            size: record.size,
            status_code,
            aborted,
        };

        if status_code == CLIENT_CLOSED_REQUEST && aborted {
            info!(
                request_id = %txn.id,
                duration_ms = txn.duration_ms(),
                "Client went away before a response"
            );
        } else {
            info!(
                request_id = %txn.id,
                status_code = txn.status_code,
                response_size = written,
                duration_ms = txn.duration_ms(),
                aborted,
                "Response sent"
            );
        }

        self.shared.log.push(txn.clone());
        // dropped while unwinding: recorded, not published
        if !std::thread::panicking() {
            self.shared.listeners.notify(&txn);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.finish(CLIENT_CLOSED_REQUEST, HashMap::new(), 0, true);
    }
}

/// Request metadata fixed before the response is produced.
struct RequestRecord {
    id: String,
    timestamp: DateTime<Utc>,
    method: String,
    url: String,
    remote_addr: String,
    headers: HashMap<String, String>,
    body: String,
    user_agent: String,
    content_type: String,
    size: i64,
}

struct PendingTransaction {
    guard: InFlightGuard,
    status_code: u16,
    response_headers: HashMap<String, String>,
    /// HEAD, 1xx, 204 and 304 responses are dropped unread by the connection
    body_less: bool,
}

impl PendingTransaction {
    fn complete(mut self, written: u64, aborted: bool) {
        let aborted = aborted && !(self.body_less && written == 0);
        let headers = std::mem::take(&mut self.response_headers);
        self.guard.finish(self.status_code, headers, written, aborted);
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_text(headers: &HeaderMap, name: http::header::HeaderName) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}
