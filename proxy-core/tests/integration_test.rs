use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    routing::{any, get},
    Json, Router,
};
use proxy_core::{ObservingProxy, ProxyConfig, ProxyServer, RunningServer, Transaction};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn start(config: ProxyConfig) -> RunningServer {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = ProxyServer::bind(config).await.unwrap();
    let addr = server.local_addr();
    let running = server.spawn();
    proxy_core::wait_for_port(addr, Duration::from_secs(2))
        .await
        .unwrap();
    running
}

/// Backend that echoes what it received.
async fn start_backend() -> SocketAddr {
    async fn echo(headers: HeaderMap, body: Bytes) -> Json<Value> {
        let headers: serde_json::Map<String, Value> = headers
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or_default())))
            .collect();
        Json(json!({
            "body": String::from_utf8_lossy(&body),
            "len": body.len(),
            "headers": headers,
        }))
    }

    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    }

    async fn raw(body: Bytes) -> Bytes {
        body
    }

    async fn teapot() -> (StatusCode, &'static str) {
        (StatusCode::IM_A_TEAPOT, "short and stout")
    }

    let app = Router::new()
        .route("/slow", get(slow))
        .route("/teapot", get(teapot))
        .route("/raw", any(raw))
        .route("/*path", any(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Backend that accepts connections and never answers.
async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Transactions are recorded when the response body completes, which can
/// trail the client seeing the last byte.
async fn wait_for_transactions(proxy: &ObservingProxy, count: usize) -> Vec<Transaction> {
    for _ in 0..200 {
        let txns = proxy.recent_transactions();
        if txns.len() >= count && proxy.stats().open_connections() == 0 {
            return txns;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} transactions, have {}",
        count,
        proxy.transaction_count()
    );
}

#[tokio::test]
async fn test_mock_webhook_scenario() {
    let running = start(ProxyConfig::mock()).await;
    let url = format!("http://{}/webhook?token=abc123", running.local_addr());

    let resp = client()
        .post(&url)
        .header("content-type", "application/json")
        .body(r#"{"a":1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-gatewatch-mode"], "mock");
    assert!(resp.headers().contains_key("x-gatewatch-timestamp"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "received");
    assert_eq!(body["method"], "POST");
    assert_eq!(body["path"], "/webhook");
    assert_eq!(body["body_size"], 7);
    assert_eq!(body["query"], "token=abc123");
    assert_eq!(body["content_type"], "application/json");

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns[0].body, r#"{"a":1}"#);
    assert_eq!(txns[0].status_code, 200);
    assert_eq!(txns[0].size, 7);
    assert!(txns[0].remote_addr.starts_with("127.0.0.1:"));
    running.shutdown().await;
}

#[tokio::test]
async fn test_proxy_replays_body_to_backend() {
    let backend = start_backend().await;
    let running = start(ProxyConfig::proxy(backend.to_string())).await;
    let url = format!("http://{}/hooks/push?id=9", running.local_addr());
    let payload = "x".repeat(64 * 1024) + "tail";

    let resp = client()
        .put(&url)
        .header("x-custom", "kept")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let echoed: Value = resp.json().await.unwrap();
    assert_eq!(echoed["body"], payload.as_str());
    assert_eq!(echoed["len"], payload.len());
    assert_eq!(echoed["headers"]["x-custom"], "kept");
    assert_eq!(echoed["headers"]["host"], backend.to_string());
    assert_eq!(echoed["headers"]["x-forwarded-proto"], "https");
    assert_eq!(echoed["headers"]["x-forwarded-for"], "127.0.0.1");
    assert_eq!(
        echoed["headers"]["x-forwarded-host"],
        running.local_addr().to_string()
    );

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns[0].body, payload);
    assert_eq!(txns[0].method, "PUT");
    assert_eq!(txns[0].url, "/hooks/push?id=9");
    running.shutdown().await;
}

#[tokio::test]
async fn test_declared_body_over_cap_is_forwarded_uncaptured() {
    let backend = start_backend().await;
    let config = ProxyConfig {
        body_capture_limit: 16,
        ..ProxyConfig::proxy(backend.to_string())
    };
    let running = start(config).await;
    let payload = "0123456789abcdefXYZ";

    let resp = client()
        .post(format!("http://{}/big", running.local_addr()))
        .body(payload)
        .send()
        .await
        .unwrap();
    let echoed: Value = resp.json().await.unwrap();
    assert_eq!(echoed["body"], payload);

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert!(txns[0].body.is_empty());
    assert_eq!(txns[0].size, payload.len() as i64);
    running.shutdown().await;
}

#[tokio::test]
async fn test_backend_status_is_recorded() {
    let backend = start_backend().await;
    let running = start(ProxyConfig::proxy(backend.to_string())).await;

    let resp = client()
        .get(format!("http://{}/teapot", running.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 418);
    assert_eq!(resp.text().await.unwrap(), "short and stout");

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns[0].status_code, 418);
    assert_eq!(txns[0].response.size, "short and stout".len() as u64);
    assert!(txns[0].is_error());
    running.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let running = start(ProxyConfig::proxy(closed.to_string())).await;

    let resp = client()
        .get(format!("http://{}/anything", running.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns[0].status_code, 502);
    running.shutdown().await;
}

#[tokio::test]
async fn test_slow_backend_is_gateway_timeout() {
    let backend = start_backend().await;
    let config = ProxyConfig {
        backend_timeout_secs: 1,
        ..ProxyConfig::proxy(backend.to_string())
    };
    let running = start(config).await;

    let resp = client()
        .get(format!("http://{}/slow", running.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns[0].status_code, 504);
    assert!(txns[0].duration >= Duration::from_secs(1));
    running.shutdown().await;
}

#[tokio::test]
async fn test_parallel_requests_balance_open_connections() {
    let running = start(ProxyConfig::mock()).await;
    let base = format!("http://{}", running.local_addr());
    let client = client();

    let mut handles = Vec::new();
    for i in 0..100 {
        let client = client.clone();
        let url = format!("{}/parallel/{}", base, i);
        handles.push(tokio::spawn(async move {
            let resp = client.get(&url).send().await.unwrap();
            assert_eq!(resp.status(), 200);
            resp.bytes().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let txns = wait_for_transactions(running.proxy(), 100).await;
    assert_eq!(txns.len(), 100);
    let stats = running.proxy().statistics();
    assert_eq!(stats.total_connections, 100);
    assert_eq!(stats.open_connections, 0);
    running.shutdown().await;
}

#[tokio::test]
async fn test_panicking_listener_is_isolated() {
    let running = start(ProxyConfig::mock()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    running
        .proxy()
        .add_listener_fn("broken", |_| panic!("listener failure"));
    let s = seen.clone();
    running
        .proxy()
        .add_listener_fn("collector", move |txn| s.lock().unwrap().push(txn.url.clone()));

    for path in ["/first", "/second"] {
        let resp = client()
            .get(format!("http://{}{}", running.local_addr(), path))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.bytes().await.unwrap();
    }

    wait_for_transactions(running.proxy(), 2).await;
    assert_eq!(*seen.lock().unwrap(), vec!["/first", "/second"]);
    running.shutdown().await;
}

#[tokio::test]
async fn test_ring_keeps_most_recent() {
    let config = ProxyConfig {
        max_transactions: 5,
        ..ProxyConfig::mock()
    };
    let running = start(config).await;

    for i in 0..8 {
        let resp = client()
            .get(format!("http://{}/n/{}", running.local_addr(), i))
            .send()
            .await
            .unwrap();
        resp.bytes().await.unwrap();
    }

    // give the last completion a moment, then check the window
    let mut urls = Vec::new();
    for _ in 0..200 {
        urls = running
            .proxy()
            .recent_transactions()
            .into_iter()
            .map(|t| t.url)
            .collect::<Vec<_>>();
        if urls.last().map(String::as_str) == Some("/n/7") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(urls, vec!["/n/3", "/n/4", "/n/5", "/n/6", "/n/7"]);
    assert_eq!(running.proxy().statistics().total_connections, 8);
    running.shutdown().await;
}

#[tokio::test]
async fn test_binary_body_is_replayed_byte_for_byte() {
    let backend = start_backend().await;
    let running = start(ProxyConfig::proxy(backend.to_string())).await;
    let payload: Vec<u8> = (0..=255u8).rev().chain([0xff, 0xfe, 0x00, 0xc3]).collect();

    let resp = client()
        .post(format!("http://{}/raw", running.local_addr()))
        .header("content-type", "application/octet-stream")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), payload.as_slice());

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns[0].size, payload.len() as i64);
    assert_eq!(txns[0].response.size, payload.len() as u64);
    running.shutdown().await;
}

#[tokio::test]
async fn test_chunked_body_over_cap_is_replayed_byte_for_byte() {
    let backend = start_backend().await;
    let config = ProxyConfig {
        body_capture_limit: 16,
        ..ProxyConfig::proxy(backend.to_string())
    };
    let running = start(config).await;

    let chunks: Vec<Vec<u8>> = vec![
        vec![0xff; 10],
        vec![0x00, 0x80, 0xfe, 0xc0, 0xc1, 0xf5],
        (0..64u8).map(|b| b.wrapping_mul(7)).collect(),
    ];
    let expected: Vec<u8> = chunks.concat();
    let stream = futures::stream::iter(
        chunks
            .into_iter()
            .map(Ok::<Vec<u8>, std::io::Error>),
    );

    let resp = client()
        .post(format!("http://{}/raw", running.local_addr()))
        .body(reqwest::Body::wrap_stream(stream))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), expected.as_slice());

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert!(txns[0].body.is_empty());
    assert_eq!(txns[0].size, -1);
    running.shutdown().await;
}

#[tokio::test]
async fn test_head_response_is_not_aborted() {
    let running = start(ProxyConfig::mock()).await;

    let resp = client()
        .head(format!("http://{}/x", running.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns[0].method, "HEAD");
    assert_eq!(txns[0].status_code, 200);
    assert!(!txns[0].aborted);
    running.shutdown().await;
}

#[tokio::test]
async fn test_client_disconnect_records_aborted_transaction() {
    let backend = start_silent_backend().await;
    let running = start(ProxyConfig::proxy(backend.to_string())).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    running
        .proxy()
        .add_listener_fn("collector", move |txn| s.lock().unwrap().push(txn.url.clone()));

    let mut stream = TcpStream::connect(running.local_addr()).await.unwrap();
    stream
        .write_all(b"GET /hang HTTP/1.1\r\nHost: gatewatch.test\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(stream);

    let txns = wait_for_transactions(running.proxy(), 1).await;
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].url, "/hang");
    assert!(txns[0].aborted);
    assert_eq!(txns[0].status_code, 499);

    let stats = running.proxy().statistics();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.open_connections, 0);
    assert_eq!(*seen.lock().unwrap(), vec!["/hang".to_string()]);
    running.shutdown().await;
}
