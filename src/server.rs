//! Tokio-based server implementation
//!
//! Accepts TLS connections, answers HTTP probes with a decoy page, and runs
//! an ingress relay per tunnel connection next to the single egress relay
//! reading the virtual interface.

use crate::config::Config;
use crate::constants::{SESSION_SWEEP_INTERVAL, TLS_HANDSHAKE_TIMEOUT};
use crate::device::{split_device, InterfaceWriter};
use crate::relay::{Egress, Ingress, RelayContext, RelayError, Route};
use crate::session::{PeerConnection, SessionCache, StreamPeer};
use crate::transport::{serve_decoy, sniff, tls};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Tunnel server instance
pub struct Server {
    /// TLS acceptor for secure connections
    acceptor: TlsAcceptor,
    /// Server configuration
    config: Config,
    /// Peer address to connection routes
    sessions: Arc<SessionCache>,
}

impl Server {
    /// Create a new server instance.
    ///
    /// Fails if the configuration is invalid or the TLS material cannot be
    /// loaded.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate_server()?;
        let server_config = tls::server_config(&config.tls)?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            config,
            sessions: Arc::new(SessionCache::new()),
        })
    }

    /// Session cache shared by the relays of this server
    pub fn sessions(&self) -> Arc<SessionCache> {
        Arc::clone(&self.sessions)
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run<D>(self, device: D, shutdown: CancellationToken) -> anyhow::Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Server listening on {}", addr);

        self.serve(listener, device, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<D>(
        self,
        listener: TcpListener,
        device: D,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ctx = RelayContext::from_config(&self.config)?;
        let (reader, interface) = split_device(device);
        let tracker = TaskTracker::new();

        let egress = Egress::new(reader, Route::Sessions(self.sessions()), ctx.clone());
        tracker.spawn(egress.run(shutdown.clone()));

        let sweeper = self
            .sessions
            .spawn_sweeper(SESSION_SWEEP_INTERVAL, shutdown.clone());
        let reporter = ctx
            .verbose
            .then(|| ctx.stats.spawn_reporter("server", shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
                result = listener.accept() => {
                    let (socket, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            if ctx.verbose {
                                warn!("Accept error: {}", e);
                            }
                            continue;
                        }
                    };
                    debug!("Accepted connection from {}", peer_addr);

                    let handler = ConnectionHandler {
                        acceptor: self.acceptor.clone(),
                        interface: interface.clone(),
                        sessions: self.sessions(),
                        ctx: ctx.clone(),
                        closed: shutdown.child_token(),
                    };
                    tracker.spawn(handler.handle(socket, peer_addr));
                }
            }
        }

        drop(listener);
        tracker.close();
        debug!("Waiting for {} connection tasks", tracker.len());
        tracker.wait().await;
        sweeper.await?;
        if let Some(reporter) = reporter {
            reporter.await?;
        }

        let stats = ctx.stats.snapshot();
        info!(
            "Server stopped: written {} bytes, read {} bytes",
            stats.written_bytes, stats.read_bytes
        );
        Ok(())
    }
}

/// Everything one accepted connection needs
struct ConnectionHandler {
    acceptor: TlsAcceptor,
    interface: InterfaceWriter,
    sessions: Arc<SessionCache>,
    ctx: RelayContext,
    /// Child of the server's shutdown token
    closed: CancellationToken,
}

impl ConnectionHandler {
    async fn handle(self, socket: TcpStream, peer_addr: SocketAddr) {
        let verbose = self.ctx.verbose;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let handshake = tokio::select! {
            _ = self.closed.cancelled() => return,
            handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, self.acceptor.accept(socket)) => handshake,
        };
        let tls_stream = match handshake {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if verbose {
                    warn!("TLS handshake with {} failed: {}", peer_addr, e);
                }
                return;
            }
            Err(_) => {
                if verbose {
                    warn!("TLS handshake with {} timed out", peer_addr);
                }
                return;
            }
        };
        debug!("TLS handshake completed with {}", peer_addr);

        let sniffed = tokio::select! {
            _ = self.closed.cancelled() => return,
            sniffed = sniff(tls_stream, self.ctx.idle_timeout) => sniffed,
        };
        let (classification, mut stream) = match sniffed {
            Ok(sniffed) => sniffed,
            Err(e) => {
                if verbose {
                    warn!("No tunnel data from {}: {}", peer_addr, e);
                }
                return;
            }
        };

        if classification.is_decoy() {
            debug!("Serving decoy page to {} ({:?})", peer_addr, classification);
            if let Err(e) = serve_decoy(&mut stream).await {
                if verbose {
                    warn!("Failed to send decoy page to {}: {}", peer_addr, e);
                }
            }
            return;
        }

        let (reader, writer) = tokio::io::split(stream);
        let peer = Arc::new(StreamPeer::new(
            writer,
            self.closed.clone(),
            peer_addr.to_string(),
        ));
        let ingress = Ingress::new(
            reader,
            peer.clone() as Arc<dyn PeerConnection>,
            self.closed.clone(),
            self.interface,
            Some(self.sessions),
            self.ctx,
        );

        match ingress.run().await {
            Ok(()) => debug!("Connection {} closed", peer.label()),
            Err(RelayError::Closed) => debug!("Connection {} closed by peer", peer.label()),
            Err(e) => {
                if verbose {
                    warn!("Connection {} ended: {}", peer.label(), e);
                }
            }
        }

        peer.close();
        if let Err(e) = peer.shutdown().await {
            debug!("Failed to shut down {} cleanly: {}", peer.label(), e);
        }
    }
}
