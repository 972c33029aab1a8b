//! Dashboard API: JSON views of the observing proxy and an operator reset.

use crate::error::ProxyError;
use crate::handlers::ObservingProxy;
use crate::model::{StatsSnapshot, Transaction};
use crate::Result;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub log_provider: bool,
    pub request_count: usize,
}

pub fn dashboard_router(proxy: ObservingProxy) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/requests", get(requests_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/health", get(health_handler))
        .route("/api/reset", post(reset_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(cors)
        .with_state(proxy)
}

/// Serve the dashboard API on an already bound listener until `shutdown`
/// resolves.
pub async fn start_dashboard_server<F>(
    listener: TcpListener,
    proxy: ObservingProxy,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Starting dashboard API on {}", addr);

    axum::serve(listener, dashboard_router(proxy))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ProxyError::Network(format!("Dashboard server failed: {}", e)))?;

    Ok(())
}

async fn requests_handler(State(proxy): State<ObservingProxy>) -> Json<Vec<Transaction>> {
    Json(proxy.recent_transactions())
}

async fn stats_handler(State(proxy): State<ObservingProxy>) -> Json<StatsSnapshot> {
    Json(proxy.statistics())
}

/// Forget recorded transactions and statistics.
async fn reset_handler(State(proxy): State<ObservingProxy>) -> Json<StatsSnapshot> {
    proxy.reset();
    info!("Dashboard reset transactions and statistics");
    Json(proxy.statistics())
}

async fn health_handler(State(proxy): State<ObservingProxy>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        log_provider: true,
        request_count: proxy.transaction_count(),
    })
}
