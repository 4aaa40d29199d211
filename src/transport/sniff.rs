//! Camouflage for the secure listener
//!
//! After the TLS handshake the first plaintext bytes decide whether the peer
//! is a tunnel client or an HTTP probe. Probes get the default page of an idle
//! nginx install and are disconnected; tunnel clients get their stream back
//! with the inspected bytes replayed in front of it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Body advertised by the decoy (the stock nginx welcome page)
pub const DECOY_BODY: &str = include_str!("decoy_index.html");

/// Complete decoy response written to HTTP probes
pub const DECOY_RESPONSE: &[u8] = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Server: nginx/1.18.0 (Ubuntu)\r\n",
    "Content-Type: text/html\r\n",
    "Content-Length: 612\r\n",
    "Connection: keep-alive\r\n",
    "Accept-Ranges: bytes\r\n",
    "\r\n",
    include_str!("decoy_index.html"),
)
.as_bytes();

/// HTTP/2 client connection preface (RFC 9113 section 3.4)
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// HTTP/1.x request line openings
const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"CONNECT ",
    b"OPTIONS ",
    b"TRACE ",
    b"PATCH ",
];

/// Scratch size for a single classification read
const SNIFF_READ_SIZE: usize = 4096;

/// What the first bytes of a connection look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Genuine,
    DecoyHttp,
    DecoyHttp2,
}

impl Classification {
    pub fn is_decoy(self) -> bool {
        !matches!(self, Classification::Genuine)
    }
}

/// Classify a prefix, or `None` while it is still a strict prefix of a signature
pub fn classify(prefix: &[u8]) -> Option<Classification> {
    if prefix.starts_with(HTTP2_PREFACE) {
        return Some(Classification::DecoyHttp2);
    }
    if HTTP_METHODS.iter().any(|method| prefix.starts_with(method)) {
        return Some(Classification::DecoyHttp);
    }
    let undecided = HTTP_METHODS
        .iter()
        .copied()
        .chain(std::iter::once(HTTP2_PREFACE))
        .any(|signature| signature.len() > prefix.len() && signature.starts_with(prefix));
    if undecided {
        None
    } else {
        Some(Classification::Genuine)
    }
}

/// Stream wrapper replaying bytes consumed during classification
#[derive(Debug)]
pub struct PeekedStream<S> {
    inner: S,
    peeked: Vec<u8>,
    pos: usize,
}

impl<S> PeekedStream<S> {
    pub fn new(inner: S, peeked: Vec<u8>) -> Self {
        Self {
            inner,
            peeked,
            pos: 0,
        }
    }

    /// Bytes read during classification that have not been replayed yet
    pub fn pending(&self) -> &[u8] {
        &self.peeked[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.peeked.len() {
            let n = (this.peeked.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.peeked[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.peeked.len() {
                this.peeked = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Read the opening bytes of `stream` and classify the connection.
///
/// Keeps reading while the bytes are a strict prefix of an HTTP signature.
/// A peer that closes mid-prefix is handed on as genuine so the relay sees the
/// end of stream itself.
///
/// # Errors
///
/// I/O errors from the stream, and `TimedOut` if nothing decisive arrives
/// within `wait`.
pub async fn sniff<S>(
    mut stream: S,
    wait: Duration,
) -> io::Result<(Classification, PeekedStream<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut peeked = Vec::new();
    let mut scratch = vec![0u8; SNIFF_READ_SIZE];

    let classification = tokio::time::timeout(wait, async {
        loop {
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                return Ok::<_, io::Error>(Classification::Genuine);
            }
            peeked.extend_from_slice(&scratch[..n]);
            if let Some(classification) = classify(&peeked) {
                return Ok(classification);
            }
        }
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no data before sniff deadline"))??;

    Ok((classification, PeekedStream::new(stream, peeked)))
}

/// Answer a probe with the decoy page and close the stream
pub async fn serve_decoy<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(DECOY_RESPONSE).await?;
    stream.flush().await?;
    stream.shutdown().await
}
