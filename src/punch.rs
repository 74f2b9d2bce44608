//! # UDP Hole Punching
//!
//! Symmetric punch: both sides burst identifying datagrams at each other
//! from the ports they will keep using, so that each NAT installs state
//! permitting the other side's packets. The first datagram received from
//! exactly the peer's address with the punch prefix declares the path
//! open.
//!
//! The socket is borrowed, never closed here: after a successful punch
//! the caller tears it down itself and rebinds the same port for the
//! transport listener.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use crate::error::LaunchError;

/// Datagrams sent per burst.
pub const PUNCH_PACKET_COUNT: u32 = 50;

/// Spacing between burst datagrams.
pub const PUNCH_INTERVAL: Duration = Duration::from_millis(100);

/// Per-read timeout while listening for the peer's punch.
pub const PUNCH_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Punch datagram payload prefix.
const PUNCH_PREFIX: &[u8] = b"PUNCH:";

/// Largest datagram we bother reading while punching.
const PUNCH_BUFFER_SIZE: usize = 1500;

/// Punch a path to `peer` through the given socket.
///
/// Emits [`PUNCH_PACKET_COUNT`] datagrams of the form
/// `PUNCH:{session_id}:{i}` spaced by [`PUNCH_INTERVAL`], concurrently
/// listening for the peer's own punch datagrams. Success is declared on
/// the first datagram whose source is exactly `peer` and whose payload
/// starts with the punch prefix; success ends the exchange immediately
/// without waiting out the rest of the burst.
pub async fn punch(
    socket: &UdpSocket,
    session_id: &str,
    peer: SocketAddr,
    deadline: Duration,
) -> Result<(), LaunchError> {
    debug!(session = session_id, %peer, "starting hole punch");

    let burst = async {
        for i in 0..PUNCH_PACKET_COUNT {
            let payload = format!("PUNCH:{}:{}", session_id, i);
            if let Err(e) = socket.send_to(payload.as_bytes(), peer).await {
                trace!(%peer, error = %e, "punch send failed");
            }
            sleep(PUNCH_INTERVAL).await;
        }
    };

    let listen = async {
        let mut buf = [0u8; PUNCH_BUFFER_SIZE];
        loop {
            match timeout(PUNCH_READ_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    if from == peer && buf[..n].starts_with(PUNCH_PREFIX) {
                        debug!(session = session_id, %from, "received punch from peer");
                        return;
                    }
                    trace!(%from, len = n, "ignoring unrelated datagram");
                }
                Ok(Err(e)) => {
                    trace!(error = %e, "punch recv failed");
                }
                Err(_) => {}
            }
        }
    };

    tokio::pin!(burst);
    let listen_bounded = timeout(deadline, listen);
    tokio::pin!(listen_bounded);

    let mut burst_done = false;
    loop {
        tokio::select! {
            result = &mut listen_bounded => {
                return match result {
                    Ok(()) => Ok(()),
                    Err(_) => Err(LaunchError::PunchTimeout),
                };
            }
            _ = &mut burst, if !burst_done => {
                burst_done = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn symmetric_punch_on_loopback() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        let side_a = punch(&a, "f00dfeedf00dfeed", addr_b, Duration::from_secs(5));
        let side_b = punch(&b, "f00dfeedf00dfeed", addr_a, Duration::from_secs(5));

        let (ra, rb) = tokio::join!(side_a, side_b);
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Peer exists but never sends.
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_b = b.local_addr().unwrap();

        let err = punch(&a, "0011223344556677", addr_b, Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::PunchTimeout));
    }

    #[tokio::test]
    async fn datagram_from_wrong_source_is_ignored() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a = a.local_addr().unwrap();
        let expected_peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        // An imposter sends a valid-looking punch from the wrong port.
        let imposter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tokio::spawn(async move {
            for _ in 0..5 {
                imposter
                    .send_to(b"PUNCH:0011223344556677:0", addr_a)
                    .await
                    .unwrap();
                sleep(Duration::from_millis(50)).await;
            }
        });

        let err = punch(
            &a,
            "0011223344556677",
            expected_peer,
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LaunchError::PunchTimeout));
    }

    #[tokio::test]
    async fn non_punch_payload_is_ignored() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        tokio::spawn(async move {
            for _ in 0..5 {
                b.send_to(b"HELLO:not-a-punch", addr_a).await.unwrap();
                sleep(Duration::from_millis(50)).await;
            }
        });

        let err = punch(&a, "0011223344556677", addr_b, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::PunchTimeout));
    }
}
