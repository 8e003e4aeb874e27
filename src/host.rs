//! Host name parsing
//! Splits a `Host` header or TLS server name into registrable domain and
//! subdomain using the public suffix list.

use crate::error::{MediatorError, Result};
use std::net::IpAddr;

/// A host split at its registrable domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostParts {
    /// Registrable domain (eTLD+1), e.g. `example.com`
    pub domain: String,
    /// Labels in front of the domain, e.g. `foo` or `a.b`; may be empty
    pub subdomain: String,
}

/// Strip a `:port` suffix from a host header value
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // bracketed IPv6 literal
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Split `host` (optionally `host:port`) into registrable domain and subdomain
pub fn resolve_host(host: &str) -> Result<HostParts> {
    let routing = |reason| MediatorError::Routing {
        host: host.to_string(),
        reason,
    };

    let name = strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        return Err(routing("empty host"));
    }
    if name.starts_with('[') || name.parse::<IpAddr>().is_ok() {
        return Err(routing("IP literals have no registrable domain"));
    }
    if name.split('.').any(|label| label.is_empty()) {
        return Err(routing("empty label"));
    }
    if !name.split('.').all(is_host_label) {
        return Err(routing("label contains characters not allowed in a host name"));
    }

    let domain = psl::domain(name.as_bytes())
        .filter(|d| d.suffix().is_known())
        .ok_or_else(|| routing("no registrable domain under a known public suffix"))?;
    let domain = std::str::from_utf8(domain.as_bytes())
        .map_err(|_| routing("host is not valid UTF-8"))?
        .to_string();

    let subdomain = name
        .strip_suffix(domain.as_str())
        .unwrap_or("")
        .trim_end_matches('.')
        .to_string();

    Ok(HostParts { domain, subdomain })
}

/// Letters, digits, `-` and `_`; the input is already lowercase
fn is_host_label(label: &str) -> bool {
    label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}
