//! Per-domain TLS configuration selected from the client's server name
//!
//! Certificates are loaded on the first handshake for a domain and cached
//! together with the certificate file's modification time. A newer file on
//! disk (e.g. after a renewal) causes one reload on the next handshake.

use crate::config::ServerConfig;
use crate::error::{MediatorError, Result};
use crate::events::{Event, EventSink};
use crate::host::resolve_host;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// ALPN identifiers advertised on every TLS configuration
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Resolves TLS configurations for configured domains
pub struct CertificateCache {
    config: Arc<ServerConfig>,
    events: Arc<dyn EventSink>,
}

impl CertificateCache {
    pub fn new(config: Arc<ServerConfig>, events: Arc<dyn EventSink>) -> Self {
        Self { config, events }
    }

    /// Select the TLS configuration for a handshake.
    ///
    /// Any error aborts the handshake; there is no fallback certificate.
    pub fn config_for_client(&self, server_name: Option<&str>) -> Result<Arc<rustls::ServerConfig>> {
        let server_name = server_name
            .filter(|name| !name.is_empty())
            .ok_or(MediatorError::MissingServerName)?;

        let domain_name = resolve_host(server_name)
            .map(|parts| parts.domain)
            .map_err(|_| MediatorError::UnknownDomain(server_name.to_string()))?;
        let domain = self
            .config
            .domain(&domain_name)
            .ok_or_else(|| MediatorError::UnknownDomain(domain_name.clone()))?;

        let modified = std::fs::metadata(&domain.cert_file)
            .and_then(|meta| meta.modified())
            .map_err(|source| MediatorError::CertificateIo {
                path: domain.cert_file.clone(),
                source,
            })?;

        domain.tls.get_or_try_refresh(modified, || {
            let tls = load_tls_config(&domain.cert_file, &domain.key_file)?;
            self.events.emit(Event::CertificateLoaded {
                domain: domain_name.clone(),
                cert: domain.cert_file.clone(),
                key: domain.key_file.clone(),
            });
            Ok(tls)
        })
    }
}

/// Build a server configuration from a PEM certificate chain and private key
pub fn load_tls_config(cert_file: &Path, key_file: &Path) -> Result<rustls::ServerConfig> {
    let load_error = |reason: String| MediatorError::CertificateLoad {
        cert: cert_file.to_path_buf(),
        key: key_file.to_path_buf(),
        reason,
    };

    let certs = load_certs(cert_file).map_err(load_error)?;
    let key = load_private_key(key_file).map_err(load_error)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| load_error(e.to_string()))?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

fn load_certs(path: &Path) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path).map_err(|e| format!("open {}: {}", path.display(), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("parse {}: {}", path.display(), e))?;
    if certs.is_empty() {
        return Err(format!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> std::result::Result<PrivateKeyDer<'static>, String> {
    let file = File::open(path).map_err(|e| format!("open {}: {}", path.display(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| format!("parse {}: {}", path.display(), e))?
        .ok_or_else(|| format!("no private key in {}", path.display()))
}
