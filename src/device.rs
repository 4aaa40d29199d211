//! Virtual interface access
//!
//! The TUN device is read by exactly one egress task and written by every
//! ingress task, so the write half sits behind a single-writer gate.

use crate::config::TunConfig;
use anyhow::Context;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::Mutex;
use tracing::info;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Serialized, shareable write access to the virtual interface.
///
/// Every `write_packet` call hands exactly one packet to the device.
#[derive(Clone)]
pub struct InterfaceWriter {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl InterfaceWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::pin(writer))),
        }
    }

    /// Write one packet to the interface
    pub async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        let mut writer = self.inner.lock().await;
        writer.write_all(packet).await?;
        writer.flush().await?;
        Ok(packet.len())
    }
}

impl std::fmt::Debug for InterfaceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceWriter").finish_non_exhaustive()
    }
}

/// Split a duplex device into its reader and the shared writer gate
pub fn split_device<D>(device: D) -> (ReadHalf<D>, InterfaceWriter)
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(device);
    (reader, InterfaceWriter::new(writer))
}

/// Create and bring up the TUN interface
pub fn open_tun(config: &TunConfig) -> anyhow::Result<tun::AsyncDevice> {
    let mut tun_config = tun::Configuration::default();
    tun_config
        .address(config.address)
        .netmask(config.netmask)
        .mtu(config.mtu)
        .up();

    let device = tun::create_as_async(&tun_config)
        .context("Failed to create TUN device (root or CAP_NET_ADMIN required)")?;
    info!(
        "TUN device up: {}/{} mtu {}",
        config.address, config.netmask, config.mtu
    );
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_writer_delivers_whole_packets() {
        let (device, mut host) = tokio::io::duplex(4096);
        let (_reader, writer) = split_device(device);

        assert_eq!(writer.write_packet(&[0x45; 20]).await.unwrap(), 20);
        let mut buf = [0u8; 20];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x45; 20]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_interleave() {
        let (device, mut host) = tokio::io::duplex(1 << 20);
        let (_reader, writer) = split_device(device);

        let mut tasks = Vec::new();
        for id in 0..8u8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    writer.write_packet(&[id; 100]).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut chunk = [0u8; 100];
        for _ in 0..400 {
            host.read_exact(&mut chunk).await.unwrap();
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }
}
