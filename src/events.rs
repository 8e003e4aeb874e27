//! Structured events emitted by the mediation engine
//!
//! Components report what happened through an [`EventSink`] handed to them at
//! construction. Production uses [`TracingSink`]; tests use [`RecordingSink`]
//! to assert on exactly what was emitted.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Host header could not be split into domain and subdomain
    HostUnresolved {
        client: SocketAddr,
        host: String,
        error: String,
    },
    /// Registrable domain is not present in configuration
    DomainUnknown {
        client: SocketAddr,
        host: String,
        domain: String,
    },
    Proxied {
        client: SocketAddr,
        host: String,
        path: String,
        target: String,
    },
    ProxyUnavailable {
        client: SocketAddr,
        target: String,
        error: String,
    },
    UpstreamFailed {
        client: SocketAddr,
        target: String,
        error: String,
    },
    /// Backend accepted a protocol upgrade; bytes are tunnelled from now on
    Upgraded {
        client: SocketAddr,
        target: String,
        protocol: String,
    },
    TunnelClosed {
        client: SocketAddr,
        target: String,
        sent: u64,
        received: u64,
    },
    TunnelFailed {
        client: SocketAddr,
        target: String,
        error: String,
    },
    FileServed {
        client: SocketAddr,
        path: PathBuf,
        size: u64,
    },
    FileNotFound {
        client: SocketAddr,
        path: PathBuf,
    },
    IndexFallback {
        client: SocketAddr,
        path: PathBuf,
        rewritten: String,
    },
    /// Fallback was requested for a path that already names an index file
    CircularFallback {
        client: SocketAddr,
        path: PathBuf,
        request_path: String,
    },
    FileStatFailed {
        client: SocketAddr,
        path: PathBuf,
        error: String,
    },
    FileOpenFailed {
        client: SocketAddr,
        path: PathBuf,
        error: String,
    },
    FileStreamFailed {
        client: SocketAddr,
        path: PathBuf,
        error: String,
    },
    PathEscapesRoot {
        client: SocketAddr,
        request_path: String,
    },
    CertificateLoaded {
        domain: String,
        cert: PathBuf,
        key: PathBuf,
    },
    HandshakeRejected {
        client: SocketAddr,
        server_name: Option<String>,
        error: String,
    },
    Redirected {
        client: SocketAddr,
        from: String,
        to: String,
    },
}

/// Receiver of mediation events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::HostUnresolved { client, host, error } => {
                error!(%client, %host, %error, "Error parsing hostname");
            }
            Event::DomainUnknown { client, host, domain } => {
                error!(%client, %host, %domain, "No such domain in config");
            }
            Event::Proxied { client, host, path, target } => {
                info!(%client, "{}{} -> {}", host, path, target);
            }
            Event::ProxyUnavailable { client, target, error } => {
                error!(%client, %target, %error, "Failed to create reverse proxy");
            }
            Event::UpstreamFailed { client, target, error } => {
                warn!(%client, %target, %error, "Upstream error");
            }
            Event::Upgraded { client, target, protocol } => {
                info!(%client, %target, %protocol, "Switching protocols");
            }
            Event::TunnelClosed { client, target, sent, received } => {
                debug!(%client, %target, sent, received, "Upgraded connection closed");
            }
            Event::TunnelFailed { client, target, error } => {
                warn!(%client, %target, %error, "Upgraded connection failed");
            }
            Event::FileServed { client, path, size } => {
                info!(%client, size, "{}", path.display());
            }
            Event::FileNotFound { client, path } => {
                info!(%client, "Does not exist: {}", path.display());
            }
            Event::IndexFallback { client, path, rewritten } => {
                info!(%client, "Index fallback for {} -> {}", path.display(), rewritten);
            }
            Event::CircularFallback { client, path, request_path } => {
                info!(
                    %client,
                    "Circular index fallback for {} -> {}",
                    path.display(),
                    request_path
                );
            }
            Event::FileStatFailed { client, path, error } => {
                warn!(%client, %error, "Could not stat {}", path.display());
            }
            Event::FileOpenFailed { client, path, error } => {
                warn!(%client, %error, "Could not open {}", path.display());
            }
            Event::FileStreamFailed { client, path, error } => {
                warn!(%client, %error, "Error encountered sending {}", path.display());
            }
            Event::PathEscapesRoot { client, request_path } => {
                warn!(%client, %request_path, "Request path escapes served directory");
            }
            Event::CertificateLoaded { domain, cert, key } => {
                info!(
                    %domain,
                    cert = %cert.display(),
                    key = %key.display(),
                    "Loaded certificate"
                );
            }
            Event::HandshakeRejected { client, server_name, error } => {
                warn!(
                    %client,
                    server_name = server_name.as_deref().unwrap_or("<none>"),
                    %error,
                    "TLS handshake rejected"
                );
            }
            Event::Redirected { client, from, to } => {
                debug!(%client, "Redirect {} -> {}", from, to);
            }
        }
    }
}

/// Keeps every event in memory, in emission order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Count of events matching a predicate
    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}
