//! # Control Protocol
//!
//! Opcode framing for the control stream: the first bidirectional stream
//! opened on every session's transport, reserved for keepalive and
//! shutdown signalling.
//!
//! ## Wire Format
//!
//! | frame | opcode | payload |
//! |-------|--------|---------|
//! | Ping  | `0x01` | 8-byte big-endian nonce |
//! | Pong  | `0x02` | 8-byte big-endian nonce |
//! | Shutdown | `0x03` | none |
//!
//! Any other opcode is a protocol violation and surfaces as a framed
//! read error; the peer that sent it gets its connection torn down by
//! the keepalive machinery.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Keepalive probe carrying a nonce the peer must echo.
pub const OP_PING: u8 = 0x01;

/// Echo of a previously received ping nonce.
pub const OP_PONG: u8 = 0x02;

/// Graceful teardown signal; the receiver stops accepting new streams.
pub const OP_SHUTDOWN: u8 = 0x03;

/// A single frame on the control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Shutdown,
}

impl ControlFrame {
    pub fn opcode(&self) -> u8 {
        match self {
            ControlFrame::Ping { .. } => OP_PING,
            ControlFrame::Pong { .. } => OP_PONG,
            ControlFrame::Shutdown => OP_SHUTDOWN,
        }
    }
}

/// Write one frame to the control stream.
pub async fn write_frame<W>(w: &mut W, frame: ControlFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match frame {
        ControlFrame::Ping { nonce } => {
            let mut buf = [0u8; 9];
            buf[0] = OP_PING;
            buf[1..].copy_from_slice(&nonce.to_be_bytes());
            w.write_all(&buf).await?;
        }
        ControlFrame::Pong { nonce } => {
            let mut buf = [0u8; 9];
            buf[0] = OP_PONG;
            buf[1..].copy_from_slice(&nonce.to_be_bytes());
            w.write_all(&buf).await?;
        }
        ControlFrame::Shutdown => {
            w.write_all(&[OP_SHUTDOWN]).await?;
        }
    }
    w.flush().await
}

/// Read the next frame from the control stream.
///
/// An unknown opcode returns `InvalidData`; the stream position is left
/// after the bad opcode byte, so callers must treat the stream as dead.
pub async fn read_frame<R>(r: &mut R) -> io::Result<ControlFrame>
where
    R: AsyncRead + Unpin,
{
    let opcode = r.read_u8().await?;
    match opcode {
        OP_PING => {
            let nonce = r.read_u64().await?;
            Ok(ControlFrame::Ping { nonce })
        }
        OP_PONG => {
            let nonce = r.read_u64().await?;
            Ok(ControlFrame::Pong { nonce })
        }
        OP_SHUTDOWN => Ok(ControlFrame::Shutdown),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown control opcode: {:#04x}", other),
        )),
    }
}
