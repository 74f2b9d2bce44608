//! # SOCKS5 Front-End
//!
//! The local face of the daemon: a TCP listener speaking SOCKS5 (no
//! auth, CONNECT only) that turns each accepted flow into one stream on
//! the current primary session.
//!
//! Per flow, the sequencing is strict: negotiate SOCKS5, ask the
//! manager for a session, open a stream, send the length-prefixed
//! target, wait for the worker's one-byte verdict, and only then start
//! splicing. A flow stays pinned to the session it opened on — rotation
//! only redirects *new* flows, which is what keeps handoff lossless.
//!
//! Per-flow errors are contained: they close that client connection and
//! nothing else.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::ConnectionManager;
use crate::splice::{splice, StreamConn};

/// SOCKS protocol version byte.
const SOCKS_VERSION: u8 = 0x05;

/// CONNECT command.
const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type.
const ATYP_IPV4: u8 = 0x01;

/// Domain-name address type.
const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address type. Not supported; the connection is closed.
const ATYP_IPV6: u8 = 0x04;

/// Method-select reply: version 5, no authentication.
const AUTH_RESPONSE: [u8; 2] = [SOCKS_VERSION, 0x00];

/// Fixed 10-byte success reply with BIND.ADDR 0.0.0.0:0.
const SUCCESS_RESPONSE: [u8; 10] = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Fixed 10-byte failure reply with BIND.ADDR 0.0.0.0:0.
const FAILURE_RESPONSE: [u8; 10] = [SOCKS_VERSION, 0x01, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Negotiation read buffer. Comfortably larger than any legal request.
const HANDSHAKE_BUFFER_SIZE: usize = 4096;

/// Longest target string the flow request framing accepts.
pub const MAX_TARGET_LEN: usize = 1024;

// ============================================================================
// Request Parsing
// ============================================================================

/// Outcome of parsing one SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A CONNECT to the contained `host:port` target.
    Connect(String),
    /// Well-formed but something we do not serve (IPv6, BIND, UDP).
    Unsupported,
    /// Not a valid SOCKS5 request at all.
    Malformed,
}

/// Parse a SOCKS5 request buffer into a target string.
pub fn parse_request(buf: &[u8]) -> RequestOutcome {
    if buf.len() < 4 {
        return RequestOutcome::Malformed;
    }
    if buf[0] != SOCKS_VERSION {
        return RequestOutcome::Malformed;
    }
    if buf[1] != CMD_CONNECT {
        return RequestOutcome::Unsupported;
    }

    match buf[3] {
        ATYP_IPV4 => {
            if buf.len() < 10 {
                return RequestOutcome::Malformed;
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            RequestOutcome::Connect(format!("{}:{}", ip, port))
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return RequestOutcome::Malformed;
            }
            let len = buf[4] as usize;
            if buf.len() < 5 + len + 2 {
                return RequestOutcome::Malformed;
            }
            let host = match std::str::from_utf8(&buf[5..5 + len]) {
                Ok(host) => host,
                Err(_) => return RequestOutcome::Malformed,
            };
            let port = u16::from_be_bytes([buf[5 + len], buf[6 + len]]);
            RequestOutcome::Connect(format!("{}:{}", host, port))
        }
        ATYP_IPV6 => RequestOutcome::Unsupported,
        _ => RequestOutcome::Malformed,
    }
}

// ============================================================================
// Flow Request Framing
// ============================================================================

/// Send the flow request: 4-byte big-endian length, then the UTF-8
/// `host:port` target.
pub async fn write_flow_request<W>(w: &mut W, target: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = target.as_bytes();
    if bytes.len() > MAX_TARGET_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("target exceeds {} bytes", MAX_TARGET_LEN),
        ));
    }
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(bytes).await?;
    w.flush().await
}

/// Read a flow request off a stream: the worker side of the contract.
///
/// Fewer than 4 length bytes is an error; a declared length of zero or
/// greater than [`MAX_TARGET_LEN`] is an error; the payload must be
/// UTF-8.
pub async fn read_flow_request<R>(r: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u32().await? as usize;
    if len == 0 || len > MAX_TARGET_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("target length {} out of range", len),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "target is not UTF-8"))
}

// ============================================================================
// Listener
// ============================================================================

/// Accept SOCKS5 clients until cancelled, dispatching each flow onto
/// the manager's current session.
pub async fn serve(
    port: u16,
    manager: Arc<ConnectionManager>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "SOCKS5 proxy listening");

    loop {
        let (client, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("SOCKS5 proxy shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            }
        };

        let Some(session) = manager.current() else {
            debug!(%peer, "no session eligible for dispatch, closing client");
            continue;
        };

        debug!(%peer, session = %session.id, "new SOCKS5 connection");
        let flow_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_flow(client, session, buffer_size, flow_cancel).await {
                debug!(%peer, error = %e, "SOCKS5 flow ended with error");
            }
        });
    }
}

/// Drive one client flow from negotiation through splice.
async fn handle_flow(
    mut client: TcpStream,
    session: Arc<crate::session::Session>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut buf = [0u8; HANDSHAKE_BUFFER_SIZE];

    // Method selection: any greeting from a v5 client gets "no auth".
    let n = client.read(&mut buf).await?;
    if n < 2 || buf[0] != SOCKS_VERSION {
        debug!("not a SOCKS5 greeting");
        return Ok(());
    }
    client.write_all(&AUTH_RESPONSE).await?;

    let n = client.read(&mut buf).await?;
    let target = match parse_request(&buf[..n]) {
        RequestOutcome::Connect(target) => target,
        RequestOutcome::Unsupported => {
            info!("unsupported SOCKS5 request, closing");
            return Ok(());
        }
        RequestOutcome::Malformed => {
            info!("malformed SOCKS5 request, closing");
            return Ok(());
        }
    };
    debug!(%target, session = %session.id, "SOCKS5 CONNECT");

    let (mut send, mut recv) = match session.transport.open_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(session = %session.id, error = %e, "failed to open tunnel stream");
            let _ = client.write_all(&FAILURE_RESPONSE).await;
            return Ok(());
        }
    };

    if let Err(e) = write_flow_request(&mut send, &target).await {
        warn!(%target, error = %e, "failed to send flow request");
        let _ = client.write_all(&FAILURE_RESPONSE).await;
        return Ok(());
    }

    let verdict = match recv.read_u8().await {
        Ok(byte) => byte,
        Err(e) => {
            warn!(%target, error = %e, "no verdict from worker");
            let _ = client.write_all(&FAILURE_RESPONSE).await;
            return Ok(());
        }
    };
    if verdict != 0x00 {
        debug!(%target, verdict, "worker could not reach target");
        client.write_all(&FAILURE_RESPONSE).await?;
        return Ok(());
    }

    client.write_all(&SUCCESS_RESPONSE).await?;
    info!(%target, session = %session.id, "tunnel established");

    let (up, down) = splice(
        client,
        StreamConn::new(send, recv),
        buffer_size,
        cancel,
        None,
    )
    .await;
    info!(%target, bytes_up = up, bytes_down = down, "flow closed");
    Ok(())
}
