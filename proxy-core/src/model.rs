//! Captured HTTP transactions and the statistics snapshot shape.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One observed request/response exchange. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub remote_addr: String,
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    pub response: ResponseRecord,
    /// Nanoseconds on the wire
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub user_agent: String,
    pub content_type: String,
    /// Declared request length, -1 when unknown
    pub size: i64,
    pub status_code: u16,
    /// Client went away before the response was fully written
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub size: u64,
}

impl Transaction {
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_nanos() as f64 / 1_000_000.0
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Point-in-time view of the statistics tracker. Times are milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub open_connections: u64,
    pub avg_response_time_1m: f64,
    pub avg_response_time_5m: f64,
    pub p50_response_time: f64,
    pub p90_response_time: f64,
}

/// Flatten a header map into name -> all values joined with `", "`.
pub fn join_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut joined: HashMap<String, String> = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let value = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        joined.insert(name.as_str().to_string(), value);
    }
    joined
}

/// Hands out `req_<unix-seconds>_<sequence>` ids.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    sequence: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req_{}_{}", Utc::now().timestamp(), seq)
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
