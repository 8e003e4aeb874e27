//! Server configuration
//! Loaded once from a JSON file; read-only afterwards apart from the
//! per-domain certificate cache and the per-backend proxy cache.

use crate::cache::{Memo, StampedMemo};
use crate::error::ConfigError;
use crate::host::resolve_host;
use crate::proxy::ReverseProxy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Top level configuration, shared by the mediator and the redirect responder
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// TCP port where TLS requests are served
    #[serde(rename = "tlsport")]
    pub tls_port: u16,
    /// TCP port where plain HTTP requests are redirected to TLS
    #[serde(rename = "insecureport")]
    pub insecure_port: u16,
    /// Log output is appended here instead of stderr when set
    #[serde(rename = "logfile", default)]
    pub log_file: Option<PathBuf>,
    /// Served registrable domains (eTLD+1), keyed by lowercase name
    pub domains: HashMap<String, DomainConfig>,
}

/// Configuration for one registrable domain and all of its subdomains
#[derive(Debug, Deserialize)]
pub struct DomainConfig {
    /// Directory holding one subdirectory per subdomain
    #[serde(rename = "basepath")]
    pub base_path: PathBuf,
    /// Subdomain used when the request names none, e.g. `www`
    #[serde(rename = "default", default)]
    pub default_subdomain: String,
    /// Path fragment between the subdomain directory and the served files,
    /// such as `public_html`
    #[serde(rename = "subdir", default)]
    pub subdir: String,
    /// Full chain certificate, PEM
    #[serde(rename = "certfile")]
    pub cert_file: PathBuf,
    #[serde(rename = "keyfile")]
    pub key_file: PathBuf,
    /// Serve the parent directory's index.html for missing paths
    #[serde(rename = "indexfallback", default)]
    pub index_fallback: bool,
    /// Subdomain label -> backend
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    /// TLS configuration, stamped with the certificate file's mtime
    #[serde(skip)]
    pub(crate) tls: StampedMemo<SystemTime, rustls::ServerConfig>,
}

/// One backend, given in the configuration file as a bare target string
#[derive(Debug, Deserialize)]
#[serde(from = "String")]
pub struct BackendConfig {
    pub target: String,
    pub(crate) proxy: Memo<ReverseProxy>,
}

impl BackendConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            proxy: Memo::new(),
        }
    }
}

impl From<String> for BackendConfig {
    fn from(target: String) -> Self {
        Self::new(target)
    }
}

impl ServerConfig {
    /// Load and validate the configuration file at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate configuration from a JSON document
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(raw)?;
        config.validated()
    }

    /// Look up a registrable domain
    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.get(name)
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        if self.tls_port == 0 || self.insecure_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }
        if self.tls_port == self.insecure_port {
            return Err(ConfigError::Invalid(format!(
                "tlsport and insecureport are both {}",
                self.tls_port
            )));
        }

        if self
            .log_file
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.log_file = None;
        }

        let mut domains = HashMap::with_capacity(self.domains.len());
        for (name, domain) in self.domains.drain() {
            let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
            if name.is_empty() {
                return Err(ConfigError::Invalid("empty domain name".to_string()));
            }
            match resolve_host(&name) {
                Ok(parts) if parts.domain == name && parts.subdomain.is_empty() => {}
                Ok(parts) => {
                    return Err(ConfigError::Invalid(format!(
                        "domain {:?} is not a registrable domain; use {:?}",
                        name, parts.domain
                    )))
                }
                Err(e) => {
                    return Err(ConfigError::Invalid(format!("domain {:?}: {}", name, e)));
                }
            }
            domain.validate(&name)?;
            if domains.insert(name.clone(), domain).is_some() {
                return Err(ConfigError::Invalid(format!("domain {:?} listed twice", name)));
            }
        }
        self.domains = domains;

        Ok(self)
    }
}

impl DomainConfig {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let suffix = format!(".{}", name);
        for label in self.backends.keys() {
            if label.is_empty() || label == name || label.ends_with(&suffix) {
                return Err(ConfigError::Invalid(format!(
                    "backend key {:?} for {} must be a bare subdomain label",
                    label, name
                )));
            }
        }
        Ok(())
    }

    /// The subdomain to serve: the requested one, or the configured default
    pub fn subdomain_or_default<'a>(&'a self, subdomain: &'a str) -> &'a str {
        if subdomain.is_empty() {
            &self.default_subdomain
        } else {
            subdomain
        }
    }

    pub fn backend(&self, subdomain: &str) -> Option<&BackendConfig> {
        self.backends.get(subdomain)
    }
}
