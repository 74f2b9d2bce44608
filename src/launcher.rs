//! # Session Launcher
//!
//! Sequences one session launch end to end: discover the public
//! endpoint, coordinate with a worker through the rendezvous store,
//! punch, hand the punched port to the transport server, and return a
//! ready [`Session`] with its keepalive task running.
//!
//! The pipeline never publishes a partial session: every resource
//! acquired along the way is owned by the pipeline and dropped on the
//! failure path before the error propagates.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::RecvStream;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PUNCH_TIMEOUT, REPLY_TIMEOUT};
use crate::control::{self, ControlFrame};
use crate::discovery::discover_public_ip;
use crate::error::LaunchError;
use crate::punch::punch;
use crate::rendezvous::RendezvousStore;
use crate::session::{generate_session_id, Session, SessionRole};
use crate::transport::accept_on_punched_port;

/// Deadline for the binding-reflection probe.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of keepalive probes on the control stream.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Read deadline for each probe's answer.
pub const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Launch Trait
// ============================================================================

/// A source of ready sessions. The connection manager only knows this
/// trait, which keeps rotation logic independent of how sessions come
/// to exist.
#[async_trait]
pub trait Launch: Send + Sync {
    async fn launch(&self, cancel: CancellationToken) -> Result<Arc<Session>, LaunchError>;
}

// ============================================================================
// SessionLauncher
// ============================================================================

/// The production launcher: STUN + rendezvous store + punch + transport.
pub struct SessionLauncher {
    config: Arc<Config>,
    store: RendezvousStore,
}

impl SessionLauncher {
    pub fn new(config: Arc<Config>, store: RendezvousStore) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl Launch for SessionLauncher {
    async fn launch(&self, cancel: CancellationToken) -> Result<Arc<Session>, LaunchError> {
        info!("starting session launch");

        let public_ip = discover_public_ip(&self.config.reflector, DISCOVERY_TIMEOUT).await?;
        debug!(%public_ip, "public endpoint discovered");

        if cancel.is_cancelled() {
            return Err(LaunchError::Cancelled);
        }

        // The ephemeral port this socket lands on is the port the whole
        // session will live on, first for punching, then for the
        // transport listener.
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| LaunchError::Internal(format!("failed to bind punch socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| LaunchError::Internal(format!("punch socket has no address: {}", e)))?;

        let session_id = generate_session_id()
            .map_err(|e| LaunchError::Internal(format!("session id generation failed: {}", e)))?;

        self.store
            .put_coordination(&session_id, &public_ip, local_addr.port())
            .await?;
        info!(session = %session_id, port = local_addr.port(), "coordination written");

        let reply = self
            .store
            .await_reply(&session_id, REPLY_TIMEOUT, &cancel)
            .await?;

        let peer_ip: IpAddr = reply.peer_public_ip.parse().map_err(|_| {
            LaunchError::Internal(format!(
                "worker reported invalid address: {}",
                reply.peer_public_ip
            ))
        })?;
        let peer_addr = SocketAddr::new(peer_ip, reply.peer_public_port);

        tokio::select! {
            _ = cancel.cancelled() => return Err(LaunchError::Cancelled),
            punched = punch(&socket, &session_id, peer_addr, PUNCH_TIMEOUT) => punched?,
        }
        info!(session = %session_id, peer = %peer_addr, "hole punched");

        // Release-then-reacquire: the transport listener needs exactly
        // this port, so the punch socket goes away first.
        drop(socket);
        let (endpoint, transport, control_tx, control_rx) =
            accept_on_punched_port(local_addr, &self.config.profile, &cancel).await?;

        let session = Arc::new(Session::new(
            session_id.clone(),
            endpoint,
            transport,
            control_tx,
            SessionRole::Primary,
            self.config.profile.session_ttl,
            reply.peer_public_ip.clone(),
            cancel,
        ));

        spawn_keepalive(session.clone(), control_rx);
        info!(session = %session_id, peer = %reply.peer_public_ip, "session established");
        Ok(session)
    }
}

// ============================================================================
// Keepalive
// ============================================================================

/// Start the keepalive for a freshly launched session.
///
/// The loop runs on its own task, with a supervisor that converts a
/// panic into an unhealthy session instead of a silently dead probe.
pub fn spawn_keepalive(session: Arc<Session>, control_rx: RecvStream) {
    let supervised = session.clone();
    tokio::spawn(async move {
        let worker = tokio::spawn(keepalive_loop(session, control_rx));
        if let Err(join_err) = worker.await {
            if join_err.is_panic() {
                error!(session = %supervised.id, "keepalive task panicked");
                supervised.set_healthy(false);
            }
        }
    });
}

/// Why a keepalive loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeExit {
    /// The session's cancellation handle fired.
    Cancelled,
    /// The transport signalled closure underneath us.
    TransportClosed,
    /// The peer sent a shutdown opcode.
    PeerShutdown,
    /// Three consecutive probes went unanswered.
    ProbesExhausted,
    /// The probe itself could not be written.
    WriteFailed,
}

async fn keepalive_loop(session: Arc<Session>, mut control_rx: RecvStream) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.tick().await; // consume the immediate first tick
    let mut nonce: u64 = 0;

    let exit = loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break ProbeExit::Cancelled,
            _ = session.transport.closed() => break ProbeExit::TransportClosed,
            _ = ticker.tick() => {
                nonce += 1;
                if let Some(exit) = probe_once(&session, &mut control_rx, nonce).await {
                    break exit;
                }
            }
        }
    };

    session.close_control().await;
    info!(session = %session.id, reason = ?exit, "keepalive stopped");
}

/// Run one probe round. `None` keeps the loop alive; `Some` carries the
/// terminal state.
async fn probe_once(
    session: &Arc<Session>,
    control_rx: &mut RecvStream,
    nonce: u64,
) -> Option<ProbeExit> {
    let probe_start = Instant::now();

    {
        let mut tx = session.control_tx.lock().await;
        if let Err(e) = control::write_frame(&mut *tx, ControlFrame::Ping { nonce }).await {
            warn!(session = %session.id, error = %e, "failed to send probe");
            session.set_healthy(false);
            return Some(ProbeExit::WriteFailed);
        }
    }

    match timeout(PROBE_READ_TIMEOUT, control::read_frame(control_rx)).await {
        Ok(Ok(ControlFrame::Pong { nonce: got })) if got == nonce => {
            let rtt = probe_start.elapsed();
            session.record_pong(rtt);
            debug!(session = %session.id, rtt_ms = rtt.as_millis() as u64, "probe answered");
            None
        }
        Ok(Ok(ControlFrame::Pong { nonce: got })) => {
            // A late answer to an earlier probe. Not a miss.
            warn!(session = %session.id, expected = nonce, got, "mismatched pong nonce");
            None
        }
        Ok(Ok(ControlFrame::Shutdown)) => {
            info!(session = %session.id, "peer signalled shutdown");
            session.set_healthy(false);
            Some(ProbeExit::PeerShutdown)
        }
        Ok(Ok(other)) => {
            warn!(session = %session.id, opcode = other.opcode(), "unexpected control frame");
            None
        }
        Ok(Err(e)) => {
            let missed = session.record_miss();
            warn!(session = %session.id, missed, error = %e, "probe read failed");
            (missed >= crate::session::MAX_MISSED_PROBES).then_some(ProbeExit::ProbesExhausted)
        }
        Err(_) => {
            let missed = session.record_miss();
            warn!(session = %session.id, missed, "probe timed out");
            (missed >= crate::session::MAX_MISSED_PROBES).then_some(ProbeExit::ProbesExhausted)
        }
    }
}
