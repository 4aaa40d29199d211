//! Packet framing on the secure stream
//!
//! TLS streams do not preserve write boundaries on the read side, so every
//! encoded packet is prefixed with its length as a big-endian u16.

use crate::constants::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", payload.len(), MAX_FRAME_SIZE),
        ));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read one frame into `buf` and return its length.
///
/// A clean end of stream surfaces as `UnexpectedEof`. Frames that do not fit
/// in `buf` are rejected with `InvalidData`.
pub async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u16().await? as usize;
    if len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds buffer of {}", len, buf.len()),
        ));
    }
    reader.read_exact(&mut buf[..len]).await?;
    Ok(len)
}
