//! Listeners
//! Serves the mediator over TLS and the HTTPS redirect over plain HTTP

use crate::config::ServerConfig;
use crate::events::{Event, EventSink};
use crate::mediator::Mediator;
use crate::redirect::Redirector;
use anyhow::{anyhow, Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info};

/// Both listeners of one configuration
pub struct Server {
    mediator: Arc<Mediator>,
    redirector: Arc<Redirector>,
}

impl Server {
    pub fn new(config: Arc<ServerConfig>, events: Arc<dyn EventSink>) -> Self {
        Self {
            redirector: Arc::new(Redirector::new(config.tls_port, events.clone())),
            mediator: Arc::new(Mediator::new(config, events)),
        }
    }

    pub fn mediator(&self) -> &Arc<Mediator> {
        &self.mediator
    }

    /// Bind both ports and serve until a listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let config = self.mediator.config();
        let tls_addr = SocketAddr::from(([0, 0, 0, 0], config.tls_port));
        let plain_addr = SocketAddr::from(([0, 0, 0, 0], config.insecure_port));

        let tls = TcpListener::bind(tls_addr)
            .await
            .with_context(|| format!("binding TLS listener on {}", tls_addr))?;
        let plain = TcpListener::bind(plain_addr)
            .await
            .with_context(|| format!("binding redirect listener on {}", plain_addr))?;

        tokio::try_join!(self.clone().serve_tls(tls), self.clone().serve_redirect(plain))?;
        Ok(())
    }

    /// Accept TLS connections and mediate their requests
    pub async fn serve_tls(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Listening with TLS on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let mediator = self.mediator.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_tls_connection(stream, remote_addr, mediator).await {
                    debug!("TLS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Accept plain HTTP connections and redirect them to TLS
    pub async fn serve_redirect(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            "Will redirect all traffic on {} to :{}",
            listener.local_addr()?,
            self.mediator.config().tls_port
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let redirector = self.redirector.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_redirect_connection(stream, remote_addr, redirector).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handshake with the certificate chosen from the ClientHello's server
    /// name, then serve HTTP/1.1 or HTTP/2 as negotiated
    async fn handle_tls_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        mediator: Arc<Mediator>,
    ) -> Result<()> {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
            .await
            .context("reading ClientHello")?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        // certificate loading reads files and may hold a per-domain lock
        let lookup = {
            let mediator = mediator.clone();
            let server_name = server_name.clone();
            tokio::task::spawn_blocking(move || mediator.config_for_client(server_name.as_deref()))
        };
        let tls_config = match lookup.await.context("certificate lookup task")? {
            Ok(config) => config,
            Err(e) => {
                mediator.events().emit(Event::HandshakeRejected {
                    client: remote_addr,
                    server_name,
                    error: e.to_string(),
                });
                return Ok(());
            }
        };

        let stream = start.into_stream(tls_config).await.context("TLS handshake")?;
        let io = TokioIo::new(stream);

        auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(
                io,
                service_fn(move |req| {
                    let mediator = mediator.clone();
                    async move { Ok::<_, Infallible>(mediator.dispatch(req, remote_addr).await) }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTPS service error: {}", e))
    }

    async fn handle_redirect_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        redirector: Arc<Redirector>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let response = redirector.handle(&req, remote_addr);
                    async move { Ok::<_, Infallible>(response) }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }
}
