//! Reverse proxying to configured backends
//!
//! A [`ReverseProxy`] holds a backend's parsed target URL and a pooled HTTP
//! client. It is built once per backend, on the first request for it, and
//! reused for the life of the process.

use crate::body::{text_response, Body, BoxError};
use crate::config::BackendConfig;
use crate::error::{MediatorError, Result};
use crate::events::{Event, EventSink};
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use url::{Position, Url};

type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

const FORWARDED: &str = "forwarded";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding handle for one backend
#[derive(Debug)]
pub struct ReverseProxy {
    target: Url,
    client: HttpClient,
}

impl ReverseProxy {
    pub fn new(target: &str, client: HttpClient) -> Result<Self> {
        Ok(Self {
            target: parse_target(target)?,
            client,
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Turn an inbound request into the request sent to the backend.
    ///
    /// The URI points at the target and `Host` becomes the target's authority.
    /// Hop-by-hop headers are dropped. Inbound `Forwarded`/`X-Forwarded-*`
    /// headers are discarded and set afresh from the connection.
    pub fn rewrite<B>(&self, req: Request<B>, client: SocketAddr) -> Result<Request<B>> {
        let (mut parts, body) = req.into_parts();

        let inbound_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        let authority = &self.target[Position::BeforeHost..Position::AfterPort];
        let mut uri = format!(
            "{}://{}{}",
            self.target.scheme(),
            authority,
            join_paths(self.target.path(), parts.uri.path())
        );
        match (self.target.query(), parts.uri.query()) {
            (Some(a), Some(b)) => uri.push_str(&format!("?{}&{}", a, b)),
            (Some(q), None) | (None, Some(q)) => uri.push_str(&format!("?{}", q)),
            (None, None) => {}
        }
        parts.uri = uri.parse::<Uri>().map_err(|e| self.target_error(e.to_string()))?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);

        let host = HeaderValue::from_str(authority).map_err(|e| self.target_error(e.to_string()))?;
        parts.headers.insert(HOST, host);

        // client-supplied forwarding headers are replaced, never extended
        for name in [FORWARDED, X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO] {
            parts.headers.remove(name);
        }
        if let Ok(value) = HeaderValue::from_str(&client.ip().to_string()) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = inbound_host {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        Ok(Request::from_parts(parts, body))
    }

    /// Send a request to the backend and stream the response back.
    ///
    /// Upstream failures become a 502; they are reported unless the
    /// exchange was cancelled by the client going away. A `101 Switching
    /// Protocols` answer to an upgrade request turns the exchange into a
    /// byte tunnel between client and backend.
    pub async fn forward(
        &self,
        mut req: Request<Body>,
        client: SocketAddr,
        events: &Arc<dyn EventSink>,
    ) -> Response<Body> {
        let protocol = upgrade_protocol(req.headers());
        let inbound = protocol.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let mut req = match self.rewrite(req, client) {
            Ok(req) => req,
            Err(e) => {
                events.emit(Event::UpstreamFailed {
                    client,
                    target: self.target.to_string(),
                    error: e.to_string(),
                });
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };
        if let Some(protocol) = &protocol {
            set_upgrade(req.headers_mut(), protocol.clone());
        }

        match self.client.request(req).await {
            Ok(mut response) => {
                let switched = response.status() == StatusCode::SWITCHING_PROTOCOLS;
                let outbound = switched.then(|| hyper::upgrade::on(&mut response));
                let accepted = upgrade_protocol(response.headers()).or(protocol);

                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                if let (Some(inbound), Some(outbound), Some(protocol)) = (inbound, outbound, accepted) {
                    set_upgrade(&mut parts.headers, protocol.clone());
                    events.emit(Event::Upgraded {
                        client,
                        target: self.target.to_string(),
                        protocol: protocol.to_str().unwrap_or_default().to_string(),
                    });
                    tokio::spawn(tunnel(
                        inbound,
                        outbound,
                        client,
                        self.target.to_string(),
                        events.clone(),
                    ));
                }
                let body = body.map_err(|e| -> BoxError { Box::new(e) }).boxed_unsync();
                Response::from_parts(parts, body)
            }
            Err(e) => {
                if !is_cancellation(&e) {
                    let error = MediatorError::Upstream {
                        target: self.target.to_string(),
                        source: Box::new(e),
                    };
                    events.emit(Event::UpstreamFailed {
                        client,
                        target: self.target.to_string(),
                        error: error.to_string(),
                    });
                }
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    fn target_error(&self, reason: String) -> MediatorError {
        MediatorError::BackendTarget {
            target: self.target.to_string(),
            reason,
        }
    }
}

/// Builds and caches reverse proxies, one per backend
pub struct ProxyRegistry {
    client: HttpClient,
    events: Arc<dyn EventSink>,
}

impl ProxyRegistry {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new());
        Self { client, events }
    }

    /// The backend's proxy handle, built on first use
    pub fn handle(&self, backend: &BackendConfig) -> Result<Arc<ReverseProxy>> {
        backend
            .proxy
            .get_or_try_init(|| ReverseProxy::new(&backend.target, self.client.clone()))
    }

    /// Proxy one request to `backend`
    pub async fn dispatch(
        &self,
        backend: &BackendConfig,
        req: Request<Body>,
        client: SocketAddr,
    ) -> Response<Body> {
        match self.handle(backend) {
            Ok(proxy) => proxy.forward(req, client, &self.events).await,
            Err(e) => {
                self.events.emit(Event::ProxyUnavailable {
                    client,
                    target: backend.target.clone(),
                    error: e.to_string(),
                });
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An error was encountered while processing your request.",
                )
            }
        }
    }
}

/// Parse a configured backend target into an absolute http(s) URL
pub fn parse_target(target: &str) -> Result<Url> {
    let error = |reason: &str| MediatorError::BackendTarget {
        target: target.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(target).map_err(|e| error(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(error("scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(error("missing host"));
    }
    Ok(url)
}

/// Join two URL paths with exactly one slash between them
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// The protocol a message asks to switch to, when it carries both
/// `Connection: upgrade` and an `Upgrade` header
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    headers.get(UPGRADE).cloned()
}

fn set_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, protocol);
}

/// Copy bytes both ways between the upgraded client and backend connections
async fn tunnel(
    inbound: OnUpgrade,
    outbound: OnUpgrade,
    client: SocketAddr,
    target: String,
    events: Arc<dyn EventSink>,
) {
    let result = async {
        let (inbound, outbound) = tokio::try_join!(inbound, outbound)?;
        let mut inbound = TokioIo::new(inbound);
        let mut outbound = TokioIo::new(outbound);
        tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
            .await
            .map_err(BoxError::from)
    }
    .await;

    match result {
        Ok((sent, received)) => events.emit(Event::TunnelClosed {
            client,
            target,
            sent,
            received,
        }),
        Err(e) => events.emit(Event::TunnelFailed {
            client,
            target,
            error: e.to_string(),
        }),
    }
}

/// Whether the error chain says the exchange was cancelled rather than failed
fn is_cancellation(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<hyper::Error>().is_some_and(hyper::Error::is_canceled) {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::empty_body;
    use crate::events::RecordingSink;
    use std::sync::Barrier;

    fn client_addr() -> SocketAddr {
        "203.0.113.7:51234".parse().unwrap()
    }

    fn registry() -> (ProxyRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (ProxyRegistry::new(sink.clone()), sink)
    }

    fn proxy(target: &str) -> ReverseProxy {
        let (registry, _) = registry();
        ReverseProxy::new(target, registry.client.clone()).unwrap()
    }

    #[test]
    fn test_parse_target() {
        assert!(parse_target("http://127.0.0.1:9000").is_ok());
        assert!(parse_target("https://backend.internal/app").is_ok());
        assert!(matches!(
            parse_target("127.0.0.1:9000"),
            Err(MediatorError::BackendTarget { .. })
        ));
        assert!(parse_target("ftp://files.internal").is_err());
        assert!(parse_target("not a url").is_err());
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/x"), "/x");
        assert_eq!(join_paths("/base", "/x"), "/base/x");
        assert_eq!(join_paths("/base/", "/x"), "/base/x");
        assert_eq!(join_paths("/base", "x"), "/base/x");
    }

    #[test]
    fn test_rewrite_targets_backend() {
        let proxy = proxy("http://127.0.0.1:9000");
        let req = Request::builder()
            .uri("/x?y=1")
            .header(HOST, "api.example.com")
            .body(())
            .unwrap();

        let out = proxy.rewrite(req, client_addr()).unwrap();

        assert_eq!(out.uri().to_string(), "http://127.0.0.1:9000/x?y=1");
        assert_eq!(out.version(), Version::HTTP_11);
        assert_eq!(out.headers()[HOST], "127.0.0.1:9000");
        assert_eq!(out.headers()[X_FORWARDED_HOST], "api.example.com");
        assert_eq!(out.headers()[X_FORWARDED_FOR], "203.0.113.7");
        assert_eq!(out.headers()[X_FORWARDED_PROTO], "https");
    }

    #[test]
    fn test_rewrite_merges_path_and_query() {
        let proxy = proxy("http://backend.internal:8080/app?key=abc");
        let req = Request::builder()
            .uri("/users?page=2")
            .header(HOST, "api.example.com")
            .body(())
            .unwrap();

        let out = proxy.rewrite(req, client_addr()).unwrap();
        assert_eq!(
            out.uri().to_string(),
            "http://backend.internal:8080/app/users?key=abc&page=2"
        );
    }

    #[test]
    fn test_rewrite_replaces_forwarding_and_drops_hop_headers() {
        let proxy = proxy("http://127.0.0.1:9000");
        let req = Request::builder()
            .uri("/")
            .header(HOST, "api.example.com")
            .header(X_FORWARDED_FOR, "10.0.0.1")
            .header(X_FORWARDED_HOST, "spoofed.example.net")
            .header(X_FORWARDED_PROTO, "http")
            .header(FORWARDED, "for=10.0.0.1;proto=http")
            .header(CONNECTION, "keep-alive, x-internal")
            .header("x-internal", "secret")
            .header("keep-alive", "timeout=5")
            .header("upgrade", "h2c")
            .header("accept", "text/html")
            .body(())
            .unwrap();

        let out = proxy.rewrite(req, client_addr()).unwrap();
        let headers = out.headers();

        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.7");
        assert_eq!(headers.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(headers[X_FORWARDED_HOST], "api.example.com");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert!(headers.get(FORWARDED).is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-internal").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("upgrade").is_none());
        assert_eq!(headers["accept"], "text/html");
    }

    #[test]
    fn test_registry_caches_handle() {
        let (registry, _) = registry();
        let backend = BackendConfig::new("http://127.0.0.1:9000");

        let first = registry.handle(&backend).unwrap();
        let second = registry.handle(&backend).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.target().as_str(), "http://127.0.0.1:9000/");
    }

    #[test]
    fn test_registry_rejects_bad_target() {
        let (registry, _) = registry();
        let backend = BackendConfig::new("::not-a-url::");

        assert!(matches!(
            registry.handle(&backend),
            Err(MediatorError::BackendTarget { .. })
        ));
        assert!(backend.proxy.get().is_none());
    }

    #[test]
    fn test_registry_concurrent_handles_identical() {
        let (registry, _) = registry();
        let backend = BackendConfig::new("http://127.0.0.1:9000");
        let barrier = Barrier::new(8);

        let handles: Vec<_> = std::thread::scope(|s| {
            let joins: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        registry.handle(&backend).unwrap()
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (registry, sink) = registry();
        let backend = BackendConfig::new(format!("http://127.0.0.1:{}", port));
        let req = Request::builder()
            .uri("/x")
            .header(HOST, "api.example.com")
            .body(empty_body())
            .unwrap();

        let response = registry.dispatch(&backend, req, client_addr()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(sink.count(|e| matches!(e, Event::UpstreamFailed { .. })), 1);
    }

    /// Reads up to and including the blank line ending an HTTP head
    async fn read_head(stream: &mut tokio::net::TcpStream) -> String {
        use tokio::io::AsyncReadExt;
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap().to_ascii_lowercase()
    }

    #[tokio::test]
    async fn test_websocket_upgrade_is_tunnelled() {
        use hyper::body::Incoming;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use std::convert::Infallible;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        // backend: accept the upgrade, then echo
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        let backend_task = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
                )
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            head
        });

        // front: plain HTTP/1.1 server handing requests to the registry
        let (registry, sink) = registry();
        let registry = Arc::new(registry);
        let backend_config = Arc::new(BackendConfig::new(format!("http://127.0.0.1:{}", backend_port)));
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, remote_addr) = front.accept().await.unwrap();
            let service = service_fn(move |req: Request<Incoming>| {
                let registry = registry.clone();
                let backend_config = backend_config.clone();
                async move {
                    let req = req.map(|b| b.map_err(|e| -> BoxError { Box::new(e) }).boxed_unsync());
                    Ok::<_, Infallible>(registry.dispatch(&backend_config, req, remote_addr).await)
                }
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(
                b"GET /socket HTTP/1.1\r\nHost: ws.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            )
            .await
            .unwrap();
        let response = read_head(&mut client).await;
        assert!(response.starts_with("http/1.1 101"), "{}", response);
        assert!(response.contains("upgrade: websocket"));

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        let backend_head = backend_task.await.unwrap();
        assert!(backend_head.starts_with("get /socket http/1.1"));
        assert!(backend_head.contains("connection: upgrade"));
        assert!(backend_head.contains("upgrade: websocket"));
        assert!(backend_head.contains("x-forwarded-host: ws.example.com"));
        assert_eq!(sink.count(|e| matches!(e, Event::Upgraded { .. })), 1);
    }

    #[tokio::test]
    async fn test_bad_target_is_500() {
        let (registry, sink) = registry();
        let backend = BackendConfig::new("nonsense");
        let req = Request::builder().uri("/").body(empty_body()).unwrap();

        let response = registry.dispatch(&backend, req, client_addr()).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(sink.count(|e| matches!(e, Event::ProxyUnavailable { .. })), 1);
    }
}
