//! Request mediation
//!
//! Every request on the TLS listener goes through [`Mediator::dispatch`]:
//! the host is split into domain and subdomain, the domain is looked up, and
//! the request is either proxied to the subdomain's backend or served from
//! the subdomain's directory.

use crate::body::{text_response, Body, BoxError};
use crate::certificate::CertificateCache;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::events::{Event, EventSink};
use crate::files::{not_found, FileOutcome, StaticFiles};
use crate::host::{resolve_host, HostParts};
use crate::proxy::ProxyRegistry;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;

/// Resolver invocations per request: the original path plus one index fallback
const MAX_FILE_ATTEMPTS: usize = 2;

const GENERIC_ERROR: &str = "An error was encountered while processing your request.";

/// Chooses between proxying and file serving for each request
pub struct Mediator {
    config: Arc<ServerConfig>,
    certificates: CertificateCache,
    proxies: ProxyRegistry,
    files: StaticFiles,
    events: Arc<dyn EventSink>,
}

impl Mediator {
    pub fn new(config: Arc<ServerConfig>, events: Arc<dyn EventSink>) -> Self {
        Self {
            certificates: CertificateCache::new(config.clone(), events.clone()),
            proxies: ProxyRegistry::new(events.clone()),
            files: StaticFiles::new(events.clone()),
            config,
            events,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    /// TLS server-name callback: the configuration for this handshake
    pub fn config_for_client(&self, server_name: Option<&str>) -> Result<Arc<rustls::ServerConfig>> {
        self.certificates.config_for_client(server_name)
    }

    /// Route one request to its backend or to the filesystem
    pub async fn dispatch<B>(&self, req: Request<B>, client: SocketAddr) -> Response<Body>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let host = request_host(&req).unwrap_or_default();

        let HostParts { domain: domain_name, subdomain } = match resolve_host(&host) {
            Ok(parts) => parts,
            Err(e) => {
                self.events.emit(Event::HostUnresolved {
                    client,
                    host,
                    error: e.to_string(),
                });
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR);
            }
        };

        let Some(domain) = self.config.domain(&domain_name) else {
            self.events.emit(Event::DomainUnknown {
                client,
                host,
                domain: domain_name,
            });
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR);
        };

        let subdomain = domain.subdomain_or_default(&subdomain).to_string();

        if let Some(backend) = domain.backend(&subdomain) {
            self.events.emit(Event::Proxied {
                client,
                host: format!("{}.{}", subdomain, domain_name),
                path: req.uri().path().to_string(),
                target: backend.target.clone(),
            });
            let req = req.map(|body| body.map_err(|e| -> BoxError { e.into() }).boxed_unsync());
            return self.proxies.dispatch(backend, req, client).await;
        }

        let mut path = req.uri().path().to_string();
        for attempt in 1..=MAX_FILE_ATTEMPTS {
            match self.files.resolve(domain, &subdomain, &path, client).await {
                FileOutcome::Served(response) => return response,
                FileOutcome::Retry(next) if attempt < MAX_FILE_ATTEMPTS => path = next,
                FileOutcome::Retry(_) => break,
            }
        }
        not_found()
    }
}

/// Host a request was sent to: the `Host` header, or the URI authority (HTTP/2)
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}
