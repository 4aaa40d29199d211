//! Traffic counters
//!
//! Bytes relayed in each direction, reported periodically in verbose mode.

use crate::constants::STATS_REPORT_INTERVAL;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
pub struct TrafficCounters {
    /// Bytes read from the interface and written to peers
    written: AtomicU64,
    /// Bytes received from peers and written to the interface
    read: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub written_bytes: u64,
    pub read_bytes: u64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_read(&self, n: usize) {
        self.read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            written_bytes: self.written.load(Ordering::Relaxed),
            read_bytes: self.read.load(Ordering::Relaxed),
        }
    }

    /// Log a snapshot every `STATS_REPORT_INTERVAL` until `shutdown` fires
    pub fn spawn_reporter(
        self: &Arc<Self>,
        role: &'static str,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        self.spawn_reporter_every(role, STATS_REPORT_INTERVAL, shutdown)
    }

    fn spawn_reporter_every(
        self: &Arc<Self>,
        role: &'static str,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let counters = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snap = counters.snapshot();
                        info!(
                            "{} stats: written {} bytes, read {} bytes",
                            role, snap.written_bytes, snap.read_bytes
                        );
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
