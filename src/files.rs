//! Static file serving from per-subdomain directory trees
//!
//! For domain base path `B`, subdomain `sub`, subdirectory fragment `S` and
//! request path `P` the served file is `B/sub/S/P`. A trailing slash serves
//! `index.html`. With index fallback enabled, a missing path is retried once
//! as its parent directory's `index.html`.

use crate::body::{text_response, Body, BoxError};
use crate::config::DomainConfig;
use crate::error::{MediatorError, Result};
use crate::events::{Event, EventSink};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures_util::{stream, TryStreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

const INDEX_FILE: &str = "index.html";
const CHUNK_SIZE: usize = 64 * 1024;

/// Result of one resolution attempt
#[derive(Debug)]
pub enum FileOutcome {
    /// A complete response (file contents or an error status)
    Served(Response<Body>),
    /// The path was missing and should be retried once as this path
    Retry(String),
}

/// Serves files below each domain's base path
pub struct StaticFiles {
    events: Arc<dyn EventSink>,
}

impl StaticFiles {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }

    /// Map a request path onto the filesystem.
    ///
    /// The request path is percent-decoded, `.`/`..` segments are collapsed,
    /// and the result must stay inside the subdomain's directory.
    pub fn candidate_path(domain: &DomainConfig, subdomain: &str, request_path: &str) -> Result<PathBuf> {
        let decoded = percent_decode_str(request_path)
            .decode_utf8()
            .map_err(|_| MediatorError::FileNotFound(PathBuf::from(request_path)))?;
        if decoded.contains('\0') {
            return Err(MediatorError::FileNotFound(PathBuf::from(request_path)));
        }

        let mut relative = decoded.trim_start_matches('/').to_string();
        if relative.is_empty() || relative.ends_with('/') {
            relative.push_str(INDEX_FILE);
        }

        let root = domain.base_path.join(subdomain_dir(subdomain, request_path)?);
        let joined = root
            .join(domain.subdir.trim_start_matches('/'))
            .join(relative);

        let path = normalize(&joined);
        let root = normalize(&root);
        if !root.starts_with(normalize(&domain.base_path)) || !path.starts_with(&root) {
            return Err(MediatorError::PathEscapesRoot(request_path.to_string()));
        }
        Ok(path)
    }

    /// Resolve one request path and build the response for it.
    ///
    /// Returns [`FileOutcome::Retry`] at most for a path that does not already
    /// name an `index.html`; the caller decides whether to honour it.
    pub async fn resolve(
        &self,
        domain: &DomainConfig,
        subdomain: &str,
        request_path: &str,
        client: SocketAddr,
    ) -> FileOutcome {
        let path = match Self::candidate_path(domain, subdomain, request_path) {
            Ok(path) => path,
            Err(MediatorError::PathEscapesRoot(request_path)) => {
                self.events.emit(Event::PathEscapesRoot { client, request_path });
                return FileOutcome::Served(not_found());
            }
            Err(_) => {
                self.events.emit(Event::FileNotFound {
                    client,
                    path: PathBuf::from(request_path),
                });
                return FileOutcome::Served(not_found());
            }
        };

        let mut metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !domain.index_fallback {
                    self.events.emit(Event::FileNotFound { client, path });
                    return FileOutcome::Served(not_found());
                }
                if request_path.ends_with("/index.html") {
                    self.events.emit(Event::CircularFallback {
                        client,
                        path,
                        request_path: request_path.to_string(),
                    });
                    return FileOutcome::Served(not_found());
                }
                let rewritten = fallback_path(request_path);
                self.events.emit(Event::IndexFallback {
                    client,
                    path,
                    rewritten: rewritten.clone(),
                });
                return FileOutcome::Retry(rewritten);
            }
            Err(e) => {
                self.report_stat_error(client, path, e);
                return FileOutcome::Served(not_found());
            }
        };

        let mut path = path;
        if metadata.is_dir() {
            path.push(INDEX_FILE);
            metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.report_stat_error(client, path, e);
                    return FileOutcome::Served(not_found());
                }
            };
        }
        if !metadata.is_file() {
            self.events.emit(Event::FileNotFound { client, path });
            return FileOutcome::Served(not_found());
        }

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.events.emit(Event::FileOpenFailed {
                    client,
                    path,
                    error: e.to_string(),
                });
                return FileOutcome::Served(text_response(
                    StatusCode::NOT_FOUND,
                    "The requested file could not be opened",
                ));
            }
        };

        let size = metadata.len();
        let mut response = Response::new(file_body(
            file.take(size),
            Transfer {
                path: path.clone(),
                client,
                events: self.events.clone(),
                expected: size,
                sent: 0,
                failed: false,
            },
        ));
        let headers = response.headers_mut();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
        if let Ok(modified) = metadata.modified() {
            if let Ok(value) = HeaderValue::from_str(&http_date(modified.into())) {
                headers.insert(LAST_MODIFIED, value);
            }
        }
        if let Some(mime) = mime_guess::from_path(&path).first_raw() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(mime));
        }

        self.events.emit(Event::FileServed { client, path, size });
        FileOutcome::Served(response)
    }

    fn report_stat_error(&self, client: SocketAddr, path: PathBuf, error: std::io::Error) {
        if error.kind() == ErrorKind::NotFound {
            self.events.emit(Event::FileNotFound { client, path });
        } else {
            self.events.emit(Event::FileStatFailed {
                client,
                path,
                error: error.to_string(),
            });
        }
    }
}

/// A subdomain names exactly one directory below the base path
fn subdomain_dir<'a>(subdomain: &'a str, request_path: &str) -> Result<&'a Path> {
    let dir = Path::new(subdomain);
    let mut components = dir.components();
    match (components.next(), components.next()) {
        (None, _) | (Some(Component::Normal(_)), None) => Ok(dir),
        _ => Err(MediatorError::PathEscapesRoot(request_path.to_string())),
    }
}

pub fn not_found() -> Response<Body> {
    text_response(StatusCode::NOT_FOUND, "The requested file does not exist")
}

/// The parent directory's index for a request path: `/a/b/c` -> `/a/b/index.html`
pub fn fallback_path(request_path: &str) -> String {
    let parent = match request_path.rfind('/') {
        Some(0) | None => "",
        Some(i) => &request_path[..i],
    };
    format!("{}/{}", parent, INDEX_FILE)
}

/// Lexically collapse `.` and `..` components; `..` never climbs above the root
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// RFC 7231 IMF-fixdate, as used by `Last-Modified`
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Progress of one file body; reports a transfer that stopped part way
struct Transfer {
    path: PathBuf,
    client: SocketAddr,
    events: Arc<dyn EventSink>,
    expected: u64,
    sent: u64,
    failed: bool,
}

impl Transfer {
    fn fail(&mut self, error: &std::io::Error) {
        self.failed = true;
        self.events.emit(Event::FileStreamFailed {
            client: self.client,
            path: self.path.clone(),
            error: error.to_string(),
        });
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if !self.failed && self.sent > 0 && self.sent < self.expected {
            self.events.emit(Event::FileStreamFailed {
                client: self.client,
                path: self.path.clone(),
                error: format!("transfer stopped after {} of {} bytes", self.sent, self.expected),
            });
        }
    }
}

fn file_body<R>(reader: R, transfer: Transfer) -> Body
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let chunks = stream::try_unfold((reader, transfer), |(mut reader, mut transfer)| async move {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => Ok(None),
            Ok(n) => {
                transfer.sent += n as u64;
                Ok(Some((Frame::data(buf.freeze()), (reader, transfer))))
            }
            Err(e) => {
                transfer.fail(&e);
                Err(e)
            }
        }
    });
    StreamBody::new(chunks.map_err(|e| -> BoxError { Box::new(e) })).boxed_unsync()
}
