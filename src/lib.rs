//! RustServe - multi-domain HTTPS front server
//!
//! One process serves many registrable domains:
//! - TLS certificates chosen per handshake from the client's server name,
//!   reloaded when the certificate file changes on disk
//! - Per-subdomain reverse proxying to configured backends
//! - Per-subdomain static files with optional index fallback
//! - Plain HTTP redirected to HTTPS

pub mod body;
pub mod cache;
pub mod certificate;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod host;
pub mod mediator;
pub mod proxy;
pub mod redirect;
pub mod server;

pub use certificate::CertificateCache;
pub use config::{BackendConfig, DomainConfig, ServerConfig};
pub use error::{ConfigError, MediatorError};
pub use events::{Event, EventSink, RecordingSink, TracingSink};
pub use files::{FileOutcome, StaticFiles};
pub use host::{resolve_host, HostParts};
pub use mediator::Mediator;
pub use proxy::{ProxyRegistry, ReverseProxy};
pub use redirect::Redirector;
pub use server::Server;
