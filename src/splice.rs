//! # Stream Adapter & Bidirectional Splicer
//!
//! [`StreamConn`] presents one multiplexed transport stream (a send and
//! a receive half) as a single full-duplex byte connection, so the
//! splicer can treat a tunnel stream and a TCP socket identically.
//!
//! [`splice`] is the data plane of every proxied flow: a full-duplex
//! copy loop with per-direction tasks whose fates are coupled through a
//! shared cancellation signal. When either direction reaches EOF or
//! errors, or the external cancel fires, both sides come down together;
//! neither direction can outlive the other unnoticed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::trace;

// ============================================================================
// Stream Adapter
// ============================================================================

/// Placeholder address reported for both ends of an adapted stream.
fn placeholder_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// A transport stream wrapped as a TCP-like byte connection.
///
/// Reads and writes delegate straight to the underlying stream halves;
/// deadlines are the caller's business (wrap in `tokio::time::timeout`).
pub struct StreamConn {
    send: SendStream,
    recv: RecvStream,
}

impl StreamConn {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub fn local_addr(&self) -> SocketAddr {
        placeholder_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        placeholder_addr()
    }
}

impl AsyncRead for StreamConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

// ============================================================================
// Bidirectional Splicer
// ============================================================================

/// Direction of one copy inside a spliced flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client socket into the tunnel stream.
    Upstream,
    /// Tunnel stream back to the client socket.
    Downstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// Per-write byte accounting callback.
pub type ByteCallback = Arc<dyn Fn(Direction, u64) + Send + Sync>;

/// Copy bytes both ways between two full-duplex connections until one
/// side finishes, errors, or `cancel` fires. Returns the byte counts
/// `(upstream, downstream)` actually written.
///
/// Writes go through `write_all`, so a short write can only surface as
/// an error, never as silent loss.
pub async fn splice<A, B>(
    client: A,
    remote: B,
    buffer_size: usize,
    cancel: CancellationToken,
    on_bytes: Option<ByteCallback>,
) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);

    // One shared stop signal couples the two directions' lifetimes and
    // inherits the caller's cancellation.
    let stop = cancel.child_token();

    let up = tokio::spawn(copy_direction(
        client_read,
        remote_write,
        buffer_size,
        stop.clone(),
        Direction::Upstream,
        on_bytes.clone(),
    ));
    let down = tokio::spawn(copy_direction(
        remote_read,
        client_write,
        buffer_size,
        stop,
        Direction::Downstream,
        on_bytes,
    ));

    let (up_bytes, down_bytes) = tokio::join!(up, down);
    (up_bytes.unwrap_or(0), down_bytes.unwrap_or(0))
}

/// One direction of a spliced flow. Cancels the shared signal on exit
/// so the opposite direction ends too, and shuts its writer down to
/// propagate EOF.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    stop: CancellationToken,
    direction: Direction,
    on_bytes: Option<ByteCallback>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut written: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = stop.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    trace!(%direction, error = %e, "splice read ended");
                    break;
                }
            }
        };

        let write = tokio::select! {
            _ = stop.cancelled() => break,
            result = writer.write_all(&buf[..n]) => result,
        };
        if let Err(e) = write {
            trace!(%direction, error = %e, "splice write ended");
            break;
        }

        written += n as u64;
        if let Some(record) = &on_bytes {
            record(direction, n as u64);
        }
    }

    stop.cancel();
    let _ = writer.shutdown().await;
    written
}
