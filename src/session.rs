//! Peer sessions
//!
//! Maps a peer key (the textual IP address of a host behind a tunnel
//! connection) to the connection that last delivered a packet from it.
//! Ingress tasks refresh entries, the egress relay reads them, and a failed
//! write removes them.

use crate::constants::{PEER_QUEUE_DEPTH, PEER_SHUTDOWN_TIMEOUT, SESSION_TTL};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::framing;

/// Write side of a tunnel connection as seen by the relay
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Send one encoded packet to the peer.
    ///
    /// Returns `Ok(0)` when the packet was dropped because the peer is not
    /// keeping up.
    async fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Mark the connection closed. Later writes fail and the reader stops.
    fn close(&self);
}

/// `PeerConnection` over the write half of a byte stream.
///
/// Writes only enqueue; a dedicated task owns the stream and writes the
/// queued packets length-prefixed, so a slow peer never blocks its callers.
/// The close token is shared with the ingress task reading the other half of
/// the stream.
pub struct StreamPeer {
    queue: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
    label: String,
    writer: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl StreamPeer {
    /// Spawn the writer task for `writer`; `closed` is usually a child of the
    /// shutdown token
    pub fn new<W>(writer: W, closed: CancellationToken, label: impl Into<String>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (queue, pending) = mpsc::channel(PEER_QUEUE_DEPTH);
        let task = tokio::spawn(drain_queue(writer, pending, closed.clone(), label.clone()));
        Self {
            queue,
            closed,
            label,
            writer: Mutex::new(Some(task)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Close the connection and wait for the writer task to shut the stream
    /// down (TLS close_notify). Packets still queued are discarded.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.closed.cancel();
        let task = self.writer.lock().await.take();
        match task {
            Some(task) => task.await.map_err(io::Error::other)?,
            None => Ok(()),
        }
    }
}

/// Write queued packets until the connection closes or a write fails, then
/// shut the stream down
async fn drain_queue<W>(
    mut writer: W,
    mut pending: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
    label: String,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let packet = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            packet = pending.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = closed.cancelled() => break,
            written = framing::write_frame(&mut writer, &packet) => written,
        };
        if let Err(e) = written {
            debug!("Write to {} failed: {}", label, e);
            closed.cancel();
            break;
        }
    }

    match tokio::time::timeout(PEER_SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("shutdown of {} timed out", label),
        )),
    }
}

#[async_trait]
impl PeerConnection for StreamPeer {
    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(not_connected(&self.label));
        }
        match self.queue.try_send(packet.to_vec()) {
            Ok(()) => Ok(packet.len()),
            Err(TrySendError::Full(_)) => Ok(0),
            Err(TrySendError::Closed(_)) => Err(not_connected(&self.label)),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

fn not_connected(label: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("connection {} is closed", label),
    )
}

/// A cached route to a peer
struct SessionEntry {
    conn: Arc<dyn PeerConnection>,
    expires_at: Instant,
}

/// Concurrent peer key to connection map with per-entry expiry.
///
/// `set` on an existing key replaces the stored connection without closing
/// the previous one. Expired entries are invisible to `get` and are dropped
/// lazily or by `purge_expired`.
pub struct SessionCache {
    entries: DashMap<String, SessionEntry>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or replace the route for `key`, valid for `ttl` from now
    pub fn set(&self, key: &str, conn: Arc<dyn PeerConnection>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        // The shard guard must be released before falling through to insert
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.conn = conn;
            entry.expires_at = expires_at;
            return;
        }
        self.entries
            .insert(key.to_string(), SessionEntry { conn, expires_at });
    }

    /// Refresh `key` with the default session lifetime
    pub fn refresh(&self, key: &str, conn: Arc<dyn PeerConnection>) {
        self.set(key, conn, SESSION_TTL);
    }

    /// Live connection for `key`, if any
    pub fn get(&self, key: &str) -> Option<Arc<dyn PeerConnection>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.conn.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        None
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove `key` only while it still routes to `conn`.
    ///
    /// Used after a failed write so that a newer connection registered for
    /// the same key in the meantime survives.
    pub fn remove_stale(&self, key: &str, conn: &Arc<dyn PeerConnection>) -> bool {
        self.entries
            .remove_if(key, |_, entry| {
                std::ptr::addr_eq(Arc::as_ptr(&entry.conn), Arc::as_ptr(conn))
            })
            .is_some()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodically purge expired entries until `shutdown` is cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!("Purged {} expired sessions", removed);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
