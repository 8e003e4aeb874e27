//! Integration tests for RustServe
//!
//! Runs the full server on local ports and talks to it over real sockets:
//! - TLS certificate selection by server name
//! - Static files with index fallback
//! - Reverse proxying to a backend
//! - Plain HTTP redirect

use rustserve::{Event, RecordingSink, Server, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::time::sleep;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Site layout for example.com plus a self-signed certificate covering it
fn write_site(dir: &Path) {
    let cert = rcgen::generate_simple_self_signed(vec![
        "example.com".to_string(),
        "*.example.com".to_string(),
    ])
    .unwrap();
    std::fs::write(dir.join("cert.pem"), cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(dir.join("key.pem"), cert.serialize_private_key_pem()).unwrap();

    let www = dir.join("sites/www/public");
    std::fs::create_dir_all(www.join("app")).unwrap();
    std::fs::write(www.join("index.html"), "<h1>home</h1>").unwrap();
    std::fs::write(www.join("app/index.html"), "<h1>app shell</h1>").unwrap();
    std::fs::write(www.join("data.bin"), vec![7u8; 200_000]).unwrap();
}

struct TestServer {
    _dir: TempDir,
    tls_port: u16,
    insecure_port: u16,
    events: Arc<RecordingSink>,
}

/// Start a server for example.com with the given backends
async fn start_server(backends: serde_json::Value) -> TestServer {
    let dir = tempdir().unwrap();
    write_site(dir.path());

    let tls_port = get_unique_port();
    let insecure_port = get_unique_port();

    let raw = serde_json::json!({
        "tlsport": tls_port,
        "insecureport": insecure_port,
        "domains": {
            "example.com": {
                "basepath": dir.path().join("sites"),
                "default": "www",
                "subdir": "public",
                "certfile": dir.path().join("cert.pem"),
                "keyfile": dir.path().join("key.pem"),
                "indexfallback": true,
                "backends": backends,
            }
        }
    });
    let config = ServerConfig::from_json(&raw.to_string()).unwrap();

    let events = Arc::new(RecordingSink::new());
    let server = Arc::new(Server::new(Arc::new(config), events.clone()));
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Wait for server to start
    sleep(Duration::from_millis(200)).await;

    TestServer {
        _dir: dir,
        tls_port,
        insecure_port,
        events,
    }
}

fn https_client(hosts: &[&str]) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none());
    for host in hosts {
        builder = builder.resolve(host, loopback());
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_serves_default_subdomain_index() {
    let server = start_server(serde_json::json!({})).await;
    let client = https_client(&["example.com"]);

    let response = client
        .get(format!("https://example.com:{}/", server.tls_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(response.text().await.unwrap(), "<h1>home</h1>");
    assert_eq!(
        server.events.count(|e| matches!(e, Event::FileServed { .. })),
        1
    );
}

#[tokio::test]
async fn test_large_file_streams_whole_body() {
    let server = start_server(serde_json::json!({})).await;
    let client = https_client(&["www.example.com"]);

    let response = client
        .get(format!("https://www.example.com:{}/data.bin", server.tls_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-length"], "200000");
    assert!(response.headers().contains_key("last-modified"));
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 200_000);
    assert!(body.iter().all(|b| *b == 7));
}

#[tokio::test]
async fn test_index_fallback_over_https() {
    let server = start_server(serde_json::json!({})).await;
    let client = https_client(&["www.example.com"]);

    let response = client
        .get(format!("https://www.example.com:{}/app/settings", server.tls_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "<h1>app shell</h1>");
    assert_eq!(
        server.events.count(|e| matches!(e, Event::IndexFallback { .. })),
        1
    );
}

#[tokio::test]
async fn test_missing_file_is_404() {
    let server = start_server(serde_json::json!({})).await;
    let client = https_client(&["www.example.com"]);

    let response = client
        .get(format!("https://www.example.com:{}/nope.txt", server.tls_port))
        .send()
        .await
        .unwrap();

    // The fallback lands on the root index.html
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "<h1>home</h1>");

    let response = client
        .get(format!("https://www.example.com:{}/missing/", server.tls_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(
        server.events.count(|e| matches!(e, Event::CircularFallback { .. })),
        1
    );
}

#[tokio::test]
async fn test_proxies_backend_subdomain() {
    let backend = MockServer::start().await;
    let server = start_server(serde_json::json!({ "api": backend.uri() })).await;

    Mock::given(method("GET"))
        .and(path("/v1/items"))
        .and(header("x-forwarded-proto", "https"))
        .and(header("x-forwarded-for", "127.0.0.1"))
        .and(header(
            "x-forwarded-host",
            format!("api.example.com:{}", server.tls_port).as_str(),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string("from backend"))
        .expect(1)
        .mount(&backend)
        .await;

    let client = https_client(&["api.example.com"]);
    let response = client
        .get(format!("https://api.example.com:{}/v1/items", server.tls_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "from backend");
    assert_eq!(server.events.count(|e| matches!(e, Event::Proxied { .. })), 1);
    assert_eq!(
        server.events.count(|e| matches!(e, Event::FileServed { .. })),
        0
    );
}

#[tokio::test]
async fn test_proxy_forwards_request_body() {
    let backend = MockServer::start().await;
    let server = start_server(serde_json::json!({ "api": backend.uri() })).await;

    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header_exists("x-forwarded-for"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&backend)
        .await;

    let client = https_client(&["api.example.com"]);
    let response = client
        .post(format!("https://api.example.com:{}/submit", server.tls_port))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "created");
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    let dead_port = get_unique_port();
    let server = start_server(serde_json::json!({
        "api": format!("http://127.0.0.1:{}", dead_port)
    }))
    .await;

    let client = https_client(&["api.example.com"]);
    let response = client
        .get(format!("https://api.example.com:{}/", server.tls_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(
        server.events.count(|e| matches!(e, Event::UpstreamFailed { .. })),
        1
    );
}

#[tokio::test]
async fn test_unknown_domain_handshake_rejected() {
    let server = start_server(serde_json::json!({})).await;
    let client = https_client(&["www.unknown.org"]);

    let result = client
        .get(format!("https://www.unknown.org:{}/", server.tls_port))
        .send()
        .await;

    assert!(result.is_err());
    assert!(
        server
            .events
            .count(|e| matches!(e, Event::HandshakeRejected { .. }))
            >= 1
    );
}

#[tokio::test]
async fn test_plain_http_redirects_to_tls_port() {
    let server = start_server(serde_json::json!({})).await;
    let client = https_client(&["www.example.com"]);

    let response = client
        .get(format!(
            "http://www.example.com:{}/docs/page?x=1",
            server.insecure_port
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 301);
    assert_eq!(
        response.headers()["location"],
        format!("https://www.example.com:{}/docs/page?x=1", server.tls_port).as_str()
    );
}
