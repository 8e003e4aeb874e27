//! Plain HTTP responder that permanently redirects every request to HTTPS

use crate::body::{empty_body, text_response, Body};
use crate::events::{Event, EventSink};
use crate::host::strip_port;
use crate::mediator::request_host;
use hyper::header::{HeaderValue, LOCATION};
use hyper::{Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Redirector {
    tls_port: u16,
    events: Arc<dyn EventSink>,
}

impl Redirector {
    pub fn new(tls_port: u16, events: Arc<dyn EventSink>) -> Self {
        Self { tls_port, events }
    }

    /// HTTPS URL for a request to `host` with `uri`
    pub fn location(&self, host: &str, uri: &Uri) -> String {
        let host = strip_port(host);
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        if self.tls_port == 443 {
            format!("https://{}{}", host, path)
        } else {
            format!("https://{}:{}{}", host, self.tls_port, path)
        }
    }

    pub fn handle<B>(&self, req: &Request<B>, client: SocketAddr) -> Response<Body> {
        let Some(host) = request_host(req).filter(|h| !h.is_empty()) else {
            return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
        };

        let target = self.location(&host, req.uri());
        let Ok(value) = HeaderValue::from_str(&target) else {
            return text_response(StatusCode::BAD_REQUEST, "Bad Request");
        };

        self.events.emit(Event::Redirected {
            client,
            from: format!("{}{}", host, req.uri()),
            to: target,
        });

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
        response.headers_mut().insert(LOCATION, value);
        response
    }
}
