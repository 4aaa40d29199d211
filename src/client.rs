//! Tunnel client implementation
//!
//! Dials the server over TLS, relays packets between the local virtual
//! interface and that single connection, and reconnects when it drops.

use crate::config::Config;
use crate::constants::{RECONNECT_DELAY, TLS_HANDSHAKE_TIMEOUT};
use crate::device::split_device;
use crate::relay::{Egress, Ingress, RelayContext, RelayError, Route};
use crate::session::{PeerConnection, StreamPeer};
use crate::transport::tls;
use anyhow::{anyhow, Context};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current upstream connection, `None` while disconnected
type Upstream = Option<Arc<dyn PeerConnection>>;

/// Tunnel client instance
pub struct Client {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    config: Config,
}

impl Client {
    /// Create a client from configuration
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate_client()?;
        let client_config = tls::client_config(&config.tls)?;
        let server_name = tls::server_name(&config.tls, &config.server_addr)?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
            config,
        })
    }

    /// Establish one TLS connection to the server
    pub async fn connect(&self) -> anyhow::Result<TlsStream<TcpStream>> {
        let addr = &self.config.server_addr;
        debug!("Attempting to connect to server: {}", addr);

        let tcp = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("Connection to {} timed out", addr))?
            .with_context(|| format!("Failed to connect to {}", addr))?;
        tcp.set_nodelay(true)?;

        let stream = tokio::time::timeout(
            TLS_HANDSHAKE_TIMEOUT,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| anyhow!("TLS handshake with {} timed out", addr))?
        .map_err(|e| anyhow!("TLS connection failed: {}", e))?;

        info!("TLS connection established with {}", addr);
        Ok(stream)
    }

    /// Relay between `device` and the server until `shutdown` fires
    pub async fn run<D>(self, device: D, shutdown: CancellationToken) -> anyhow::Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ctx = RelayContext::from_config(&self.config)?;
        let (reader, interface) = split_device(device);
        let (upstream_tx, upstream_rx) = watch::channel::<Upstream>(None);

        let egress = Egress::new(reader, Route::Upstream(upstream_rx), ctx.clone());
        let egress = tokio::spawn(egress.run(shutdown.clone()));
        let reporter = ctx
            .verbose
            .then(|| ctx.stats.spawn_reporter("client", shutdown.clone()));

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = self.connect() => connected,
            };

            match connected {
                Ok(stream) => {
                    let (read_half, write_half) = tokio::io::split(stream);
                    let closed = shutdown.child_token();
                    let peer = Arc::new(StreamPeer::new(
                        write_half,
                        closed.clone(),
                        self.config.server_addr.clone(),
                    ));
                    upstream_tx.send_replace(Some(peer.clone() as Arc<dyn PeerConnection>));

                    let ingress = Ingress::new(
                        read_half,
                        peer.clone() as Arc<dyn PeerConnection>,
                        closed,
                        interface.clone(),
                        None,
                        ctx.clone(),
                    );
                    let result = ingress.run().await;

                    upstream_tx.send_replace(None);
                    peer.close();
                    if let Err(e) = peer.shutdown().await {
                        debug!("Failed to shut down connection cleanly: {}", e);
                    }

                    match result {
                        Ok(()) => {}
                        Err(RelayError::Closed) => info!("Server closed the connection"),
                        Err(e) => {
                            if ctx.verbose {
                                warn!("Connection lost: {}", e);
                            }
                        }
                    }
                }
                Err(e) => warn!("{:#}", e),
            }

            if shutdown.is_cancelled() {
                break;
            }
            info!("Reconnecting in {:?}", RECONNECT_DELAY);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        info!("Shutdown signal received, stopping client");
        egress.await?;
        if let Some(reporter) = reporter {
            reporter.await?;
        }
        Ok(())
    }
}
