//! Packet relays between the virtual interface and tunnel connections
//!
//! `Egress` is the single task reading the interface and routing each packet
//! to the connection registered for its destination. `Ingress` runs once per
//! tunnel connection, decoding frames, refreshing the route for each source
//! address and writing the packets to the interface.

use crate::config::Config;
use crate::constants::MAX_FRAME_SIZE;
use crate::device::InterfaceWriter;
use crate::obfuscation::{CodecError, Pipeline};
use crate::packet;
use crate::session::{PeerConnection, SessionCache};
use crate::stats::TrafficCounters;
use crate::transport::framing;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why an ingress relay stopped
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no traffic for {0:?}")]
    Idle(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("undecodable frame: {0}")]
    Codec(#[from] CodecError),
}

/// Settings shared by every relay task of one role
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub pipeline: Pipeline,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub verbose: bool,
    pub stats: Arc<TrafficCounters>,
}

impl RelayContext {
    pub fn from_config(config: &Config) -> Result<Self, CodecError> {
        Ok(Self {
            pipeline: Pipeline::from_config(config)?,
            idle_timeout: config.idle_timeout(),
            buffer_size: config.buffer_size,
            verbose: config.verbose,
            stats: Arc::new(TrafficCounters::new()),
        })
    }
}

/// Where egress packets go
pub enum Route {
    /// Look the destination up in the session cache (server role)
    Sessions(Arc<SessionCache>),
    /// Send everything to the current upstream connection (client role)
    Upstream(watch::Receiver<Option<Arc<dyn PeerConnection>>>),
}

/// Interface to network relay
pub struct Egress<R> {
    reader: R,
    route: Route,
    ctx: RelayContext,
}

impl<R> Egress<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, route: Route, ctx: RelayContext) -> Self {
        Self { reader, route, ctx }
    }

    /// Relay until `shutdown` fires or the interface reaches end of stream.
    ///
    /// Interface read errors are logged in verbose mode and the loop continues.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            mut reader,
            route,
            ctx,
        } = self;
        let mut buf = vec![0u8; ctx.buffer_size];
        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Egress relay stopping");
                    return;
                }
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        info!("Virtual interface closed, egress relay stopping");
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        if ctx.verbose {
                            warn!("Interface read error: {}", e);
                        }
                        tokio::task::yield_now().await;
                        continue;
                    }
                }
            };
            forward(&route, &ctx, &buf[..n]).await;
        }
    }
}

/// Send one interface packet to the connection it routes to
async fn forward(route: &Route, ctx: &RelayContext, packet: &[u8]) {
    let key = packet::dst_key(packet);
    let conn = match route {
        Route::Sessions(sessions) => {
            if key.is_empty() {
                return;
            }
            match sessions.get(&key) {
                Some(conn) => conn,
                None => return,
            }
        }
        Route::Upstream(upstream) => {
            let current = upstream.borrow().clone();
            match current {
                Some(conn) => conn,
                None => return,
            }
        }
    };

    let encoded = ctx.pipeline.encode(packet);
    if encoded.len() > MAX_FRAME_SIZE {
        if ctx.verbose {
            warn!(
                "Dropping packet for {}: encoded size {} exceeds frame limit",
                key,
                encoded.len()
            );
        }
        return;
    }

    match conn.write(&encoded).await {
        Ok(0) => {
            if ctx.verbose {
                debug!("Dropping packet for {}: connection is backlogged", key);
            }
        }
        Ok(_) => ctx.stats.add_written(packet.len()),
        Err(e) => {
            if ctx.verbose {
                warn!("Write to {} failed: {}", key, e);
            }
            match route {
                Route::Sessions(sessions) => {
                    sessions.remove_stale(&key, &conn);
                }
                // Wakes the client's ingress so it reconnects
                Route::Upstream(_) => conn.close(),
            }
        }
    }
}

/// Network to interface relay for one tunnel connection
pub struct Ingress<R> {
    reader: R,
    peer: Arc<dyn PeerConnection>,
    closed: CancellationToken,
    interface: InterfaceWriter,
    sessions: Option<Arc<SessionCache>>,
    ctx: RelayContext,
}

impl<R> Ingress<R>
where
    R: AsyncRead + Unpin,
{
    /// `peer` is registered in `sessions` for every source address seen on
    /// `reader`. The client role passes no cache.
    pub fn new(
        reader: R,
        peer: Arc<dyn PeerConnection>,
        closed: CancellationToken,
        interface: InterfaceWriter,
        sessions: Option<Arc<SessionCache>>,
        ctx: RelayContext,
    ) -> Self {
        Self {
            reader,
            peer,
            closed,
            interface,
            sessions,
            ctx,
        }
    }

    /// Relay until the connection is closed, idles out, fails or sends an
    /// undecodable frame.
    ///
    /// Returns `Ok(())` only when the close token was cancelled locally.
    pub async fn run(mut self) -> Result<(), RelayError> {
        // Sized for any u16 frame, independent of the interface buffer size
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        let idle = self.ctx.idle_timeout;
        loop {
            let read = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(()),
                read = tokio::time::timeout(idle, framing::read_frame(&mut self.reader, &mut buf)) => read,
            };
            let n = match read {
                Err(_) => return Err(RelayError::Idle(idle)),
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(RelayError::Closed)
                }
                Ok(Err(e)) => return Err(RelayError::Io(e)),
                Ok(Ok(n)) => n,
            };
            self.deliver(&buf[..n]).await?;
        }
    }

    async fn deliver(&self, frame: &[u8]) -> Result<(), RelayError> {
        let packet = self.ctx.pipeline.decode(frame)?;
        let key = packet::src_key(&packet);
        if key.is_empty() {
            return Ok(());
        }

        if let Some(sessions) = &self.sessions {
            sessions.refresh(&key, Arc::clone(&self.peer));
        }

        match self.interface.write_packet(&packet).await {
            Ok(n) => self.ctx.stats.add_read(n),
            Err(e) => {
                if self.ctx.verbose {
                    warn!("Interface write error: {}", e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::split_device;
    use crate::obfuscation::{Compressor, Obfuscator};
    use crate::packet::tests::{ipv4_packet, ipv6_packet};
    use crate::session::tests::RecordingPeer;
    use crate::session::StreamPeer;
    use std::net::Ipv6Addr;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn context(pipeline: Pipeline, idle_timeout: Duration) -> RelayContext {
        RelayContext {
            pipeline,
            idle_timeout,
            buffer_size: 2048,
            verbose: true,
            stats: Arc::new(TrafficCounters::new()),
        }
    }

    fn full_pipeline() -> Pipeline {
        Pipeline::new(
            Some(Obfuscator::new("freedom@2023").unwrap()),
            Some(Compressor::new()),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Interface whose host side the test drives; returns (reader, writer, host)
    fn interface() -> (tokio::io::ReadHalf<DuplexStream>, InterfaceWriter, DuplexStream) {
        let (device, host) = tokio::io::duplex(1 << 16);
        let (reader, writer) = split_device(device);
        (reader, writer, host)
    }

    #[tokio::test]
    async fn test_egress_routes_by_destination() {
        let sessions = Arc::new(SessionCache::new());
        let peer = Arc::new(RecordingPeer::default());
        sessions.refresh("10.0.0.2", peer.clone());

        let (reader, _writer, mut host) = interface();
        let ctx = context(Pipeline::identity(), Duration::from_secs(5));
        let stats = ctx.stats.clone();
        let shutdown = CancellationToken::new();
        let egress = Egress::new(reader, Route::Sessions(sessions), ctx);
        let handle = tokio::spawn(egress.run(shutdown.clone()));

        let routed = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], b"hello");
        let unrouted = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 3], b"nobody");
        host.write_all(&unrouted).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.write_all(&routed).await.unwrap();

        wait_until(|| !peer.written().is_empty()).await;
        assert_eq!(peer.written(), vec![routed.clone()]);
        assert_eq!(stats.snapshot().written_bytes, routed.len() as u64);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_egress_write_failure_drops_route() {
        let sessions = Arc::new(SessionCache::new());
        sessions.refresh("10.0.0.2", Arc::new(RecordingPeer::failing()));

        let (reader, _writer, mut host) = interface();
        let shutdown = CancellationToken::new();
        let egress = Egress::new(
            reader,
            Route::Sessions(sessions.clone()),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(egress.run(shutdown.clone()));

        host.write_all(&ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], b"x"))
            .await
            .unwrap();
        wait_until(|| sessions.get("10.0.0.2").is_none()).await;

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_egress_upstream_follows_watch() {
        let (tx, rx) = watch::channel::<Option<Arc<dyn PeerConnection>>>(None);
        let (reader, _writer, mut host) = interface();
        let shutdown = CancellationToken::new();
        let egress = Egress::new(
            reader,
            Route::Upstream(rx),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(egress.run(shutdown.clone()));

        // Dropped while no upstream is connected
        host.write_all(&ipv4_packet([172, 16, 0, 2], [1, 1, 1, 1], b"early"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let peer = Arc::new(RecordingPeer::default());
        tx.send(Some(peer.clone() as Arc<dyn PeerConnection>)).unwrap();
        let packet = ipv4_packet([172, 16, 0, 2], [8, 8, 8, 8], b"late");
        host.write_all(&packet).await.unwrap();

        wait_until(|| !peer.written().is_empty()).await;
        assert_eq!(peer.written(), vec![packet]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_egress_stops_at_interface_eof() {
        let (reader, _writer, host) = interface();
        drop(host);
        let egress = Egress::new(
            reader,
            Route::Sessions(Arc::new(SessionCache::new())),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        tokio::time::timeout(Duration::from_secs(1), egress.run(CancellationToken::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ingress_registers_source_and_writes_interface() {
        let sessions = Arc::new(SessionCache::new());
        let (_reader, writer, mut host) = interface();
        let (mut remote, local) = tokio::io::duplex(1 << 16);
        let peer: Arc<dyn PeerConnection> = Arc::new(RecordingPeer::default());
        let closed = CancellationToken::new();

        let ingress = Ingress::new(
            local,
            peer.clone(),
            closed.clone(),
            writer,
            Some(sessions.clone()),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(ingress.run());

        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dst: Ipv6Addr = "fe80::2".parse().unwrap();
        let packet = ipv6_packet(src, dst, b"ping");
        framing::write_frame(&mut remote, &packet).await.unwrap();

        let mut delivered = vec![0u8; packet.len()];
        host.read_exact(&mut delivered).await.unwrap();
        assert_eq!(delivered, packet);

        let found = sessions.get("fe80::1").expect("source registered");
        assert!(std::ptr::addr_eq(Arc::as_ptr(&found), Arc::as_ptr(&peer)));

        closed.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ingress_drops_truncated_ipv6_packet() {
        let sessions = Arc::new(SessionCache::new());
        let (reader, writer, mut host) = interface();
        let (mut remote, local) = tokio::io::duplex(4096);

        let ingress = Ingress::new(
            local,
            Arc::new(RecordingPeer::default()),
            CancellationToken::new(),
            writer,
            Some(sessions.clone()),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(ingress.run());

        let mut short = vec![0u8; 28];
        short[0] = 0x60;
        short[8..24].copy_from_slice(&"fe80::1".parse::<Ipv6Addr>().unwrap().octets());
        framing::write_frame(&mut remote, &short).await.unwrap();
        drop(remote);

        assert!(matches!(handle.await.unwrap(), Err(RelayError::Closed)));
        assert!(sessions.is_empty());

        // Nothing reached the interface before both halves were dropped
        drop(reader);
        let mut leftover = Vec::new();
        host.read_to_end(&mut leftover).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_ingress_stops_on_undecodable_frame() {
        let (_reader, writer, _host) = interface();
        let (mut remote, local) = tokio::io::duplex(4096);
        let ingress = Ingress::new(
            local,
            Arc::new(RecordingPeer::default()),
            CancellationToken::new(),
            writer,
            None,
            context(full_pipeline(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(ingress.run());

        framing::write_frame(&mut remote, b"not lz4 at all").await.unwrap();
        assert!(matches!(handle.await.unwrap(), Err(RelayError::Codec(_))));
    }

    #[tokio::test]
    async fn test_ingress_idle_timeout() {
        let (_reader, writer, _host) = interface();
        let (_remote, local) = tokio::io::duplex(4096);
        let ingress = Ingress::new(
            local,
            Arc::new(RecordingPeer::default()),
            CancellationToken::new(),
            writer,
            None,
            context(Pipeline::identity(), Duration::from_millis(30)),
        );
        assert!(matches!(ingress.run().await, Err(RelayError::Idle(_))));
    }

    #[tokio::test]
    async fn test_compressed_obfuscated_roundtrip_between_relays() {
        // Server egress -> StreamPeer -> client ingress
        let sessions = Arc::new(SessionCache::new());
        let (wire_server, wire_client) = tokio::io::duplex(1 << 16);
        let peer = Arc::new(StreamPeer::new(
            wire_server,
            CancellationToken::new(),
            "client",
        ));
        sessions.refresh("172.16.0.2", peer);

        let (server_reader, _server_writer, mut server_host) = interface();
        let shutdown = CancellationToken::new();
        let egress = Egress::new(
            server_reader,
            Route::Sessions(sessions),
            context(full_pipeline(), Duration::from_secs(5)),
        );
        let egress_handle = tokio::spawn(egress.run(shutdown.clone()));

        let (_client_reader, client_writer, mut client_host) = interface();
        let closed = CancellationToken::new();
        let ingress = Ingress::new(
            wire_client,
            Arc::new(RecordingPeer::default()),
            closed.clone(),
            client_writer,
            None,
            context(full_pipeline(), Duration::from_secs(5)),
        );
        let ingress_handle = tokio::spawn(ingress.run());

        let payload: Vec<u8> = (0..600u32).map(|i| (i % 7) as u8).collect();
        let packet = ipv4_packet([172, 16, 0, 1], [172, 16, 0, 2], &payload);
        server_host.write_all(&packet).await.unwrap();

        let mut received = vec![0u8; packet.len()];
        client_host.read_exact(&mut received).await.unwrap();
        assert_eq!(received, packet);

        closed.cancel();
        shutdown.cancel();
        egress_handle.await.unwrap();
        assert!(ingress_handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_others() {
        let sessions = Arc::new(SessionCache::new());
        // Nobody reads the far end of the stalled connection
        let (stalled_wire, _stalled_far) = tokio::io::duplex(256);
        let stalled = Arc::new(StreamPeer::new(stalled_wire, CancellationToken::new(), "stalled"));
        sessions.refresh("10.0.0.2", stalled.clone());
        let healthy = Arc::new(RecordingPeer::default());
        sessions.refresh("10.0.0.3", healthy.clone());

        let (reader, _writer, mut host) = interface();
        let shutdown = CancellationToken::new();
        let egress = Egress::new(
            reader,
            Route::Sessions(sessions.clone()),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(egress.run(shutdown.clone()));

        let bulk = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], &[0u8; 1000]);
        for _ in 0..4 {
            host.write_all(&bulk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 3], b"still routed");
        host.write_all(&packet).await.unwrap();

        wait_until(|| !healthy.written().is_empty()).await;
        assert_eq!(healthy.written(), vec![packet]);
        // A slow connection keeps its route
        assert!(sessions.get("10.0.0.2").is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("egress stops on shutdown")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), stalled.shutdown())
            .await
            .expect("stalled connection shuts down")
            .unwrap();
    }

    /// Reader failing once before handing over to `inner`
    struct FlakyReader<R> {
        inner: R,
        failed: bool,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for FlakyReader<R> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if !self.failed {
                self.failed = true;
                return std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "transient device error",
                )));
            }
            std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    /// Reader that is `Send` but not `Sync`, like some platform devices
    struct SendOnlyReader<R> {
        inner: R,
        _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for SendOnlyReader<R> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn test_egress_spawns_with_send_only_reader() {
        let sessions = Arc::new(SessionCache::new());
        let peer = Arc::new(RecordingPeer::default());
        sessions.refresh("10.0.0.2", peer.clone());

        let (reader, _writer, mut host) = interface();
        let reader = SendOnlyReader {
            inner: reader,
            _not_sync: std::marker::PhantomData,
        };
        let shutdown = CancellationToken::new();
        let egress = Egress::new(
            reader,
            Route::Sessions(sessions),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(egress.run(shutdown.clone()));

        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], b"spawned");
        host.write_all(&packet).await.unwrap();
        wait_until(|| !peer.written().is_empty()).await;

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_egress_continues_after_read_error() {
        let sessions = Arc::new(SessionCache::new());
        let peer = Arc::new(RecordingPeer::default());
        sessions.refresh("10.0.0.2", peer.clone());

        let (reader, _writer, mut host) = interface();
        let reader = FlakyReader {
            inner: reader,
            failed: false,
        };
        let shutdown = CancellationToken::new();
        let egress = Egress::new(
            reader,
            Route::Sessions(sessions),
            context(Pipeline::identity(), Duration::from_secs(5)),
        );
        let handle = tokio::spawn(egress.run(shutdown.clone()));

        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], b"after error");
        host.write_all(&packet).await.unwrap();

        wait_until(|| !peer.written().is_empty()).await;
        assert_eq!(peer.written(), vec![packet]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ingress_accepts_frames_larger_than_interface_buffer() {
        let (_reader, writer, mut host) = interface();
        let (mut remote, local) = tokio::io::duplex(1 << 16);
        let ctx = context(Pipeline::identity(), Duration::from_secs(5));
        assert_eq!(ctx.buffer_size, 2048);
        let closed = CancellationToken::new();
        let ingress = Ingress::new(
            local,
            Arc::new(RecordingPeer::default()),
            closed.clone(),
            writer,
            None,
            ctx,
        );
        let handle = tokio::spawn(ingress.run());

        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], &[7u8; 4000]);
        framing::write_frame(&mut remote, &packet).await.unwrap();

        let mut delivered = vec![0u8; packet.len()];
        host.read_exact(&mut delivered).await.unwrap();
        assert_eq!(delivered, packet);

        closed.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
