//! Error types for request mediation and configuration loading

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while routing a request or a TLS handshake
#[derive(Debug, Error)]
pub enum MediatorError {
    /// The host could not be split into registrable domain and subdomain
    #[error("could not resolve host {host:?}: {reason}")]
    Routing { host: String, reason: &'static str },

    /// The ClientHello carried no server name
    #[error("TLS ClientHello has no server name")]
    MissingServerName,

    /// The registrable domain is not configured
    #[error("configuration contains no domain {0:?}")]
    UnknownDomain(String),

    #[error("stat certificate file {path:?}: {source}")]
    CertificateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("loading key pair ({cert:?}, {key:?}): {reason}")]
    CertificateLoad {
        cert: PathBuf,
        key: PathBuf,
        reason: String,
    },

    #[error("parsing backend target {target:?}: {reason}")]
    BackendTarget { target: String, reason: String },

    #[error("upstream {target}: {source}")]
    Upstream {
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("does not exist: {0:?}")]
    FileNotFound(PathBuf),

    #[error("could not stat {path:?}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The normalized file path left the subdomain's directory tree
    #[error("request path {0:?} escapes the served directory")]
    PathEscapesRoot(String),
}

/// Errors raised while loading the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("opening config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unmarshalling config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = MediatorError> = std::result::Result<T, E>;
