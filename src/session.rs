//! # Session
//!
//! One established, encrypted, stream-multiplexing path to a worker.
//! Sessions are created by the launcher, owned exclusively by the
//! connection manager, and destroyed when the manager cancels them or
//! the transport closes underneath them.
//!
//! Role and health live behind their own locks so the keepalive task,
//! the monitor, and the SOCKS5 dispatch path can observe them without
//! holding the manager lock. Role transitions themselves only happen
//! while the manager lock is held, which is what makes promotion atomic
//! with respect to dispatch.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use quinn::{Connection, Endpoint, SendStream, VarInt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::control::{self, ControlFrame};

/// Probe misses tolerated before a session is declared unhealthy.
pub const MAX_MISSED_PROBES: u32 = 3;

/// Generate a fresh 16-hex-character session id.
pub fn generate_session_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Recover a sync lock even if a panicking task poisoned it.
fn relock<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Roles
// ============================================================================

/// Lifecycle role of a session. At most one `Primary` and at most one
/// `Secondary` exist at any time; dispatch never targets `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Primary,
    Secondary,
    Draining,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Primary => write!(f, "primary"),
            SessionRole::Secondary => write!(f, "secondary"),
            SessionRole::Draining => write!(f, "draining"),
        }
    }
}

// ============================================================================
// Health State
// ============================================================================

/// Keepalive-driven health, protected by one per-session mutex.
#[derive(Debug, Clone)]
pub struct HealthState {
    healthy: bool,
    missed_probes: u32,
    last_rtt: Option<Duration>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            healthy: true,
            missed_probes: 0,
            last_rtt: None,
        }
    }

    /// A matching pong arrived: reset misses, record the round trip.
    pub fn record_pong(&mut self, rtt: Duration) {
        self.healthy = true;
        self.missed_probes = 0;
        self.last_rtt = Some(rtt);
    }

    /// A probe went unanswered. Returns the new miss count; the session
    /// flips unhealthy only on the [`MAX_MISSED_PROBES`]th miss.
    pub fn record_miss(&mut self) -> u32 {
        self.missed_probes += 1;
        if self.missed_probes >= MAX_MISSED_PROBES {
            self.healthy = false;
        }
        self.missed_probes
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn set_healthy(&mut self, healthy: bool) {
        self.healthy = healthy;
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Session
// ============================================================================

/// An established path to one worker.
pub struct Session {
    /// 16 hex characters, unique across concurrent sessions.
    pub id: String,
    /// Listener the transport was accepted on; kept alive with the session.
    endpoint: Endpoint,
    /// The multiplexed transport. Opening streams is safe from any task.
    pub transport: Connection,
    /// Send half of the control stream. The keepalive task and drain
    /// cleanup both write through this lock; the receive half is owned
    /// by the keepalive task alone.
    pub control_tx: tokio::sync::Mutex<SendStream>,
    role: Mutex<SessionRole>,
    /// Captured when the launcher completed.
    pub started_at: Instant,
    pub ttl: Duration,
    health: Mutex<HealthState>,
    /// Worker-reported public IP, for display only.
    pub peer_public_ip: String,
    /// Tears down this session's background work.
    pub cancel: CancellationToken,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        endpoint: Endpoint,
        transport: Connection,
        control_tx: SendStream,
        role: SessionRole,
        ttl: Duration,
        peer_public_ip: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            endpoint,
            transport,
            control_tx: tokio::sync::Mutex::new(control_tx),
            role: Mutex::new(role),
            started_at: Instant::now(),
            ttl,
            health: Mutex::new(HealthState::new()),
            peer_public_ip,
            cancel,
        }
    }

    pub fn role(&self) -> SessionRole {
        *relock(&self.role)
    }

    /// Change the role. Callers must hold the manager lock so dispatch
    /// never observes a half-finished rotation.
    pub fn set_role(&self, role: SessionRole) {
        *relock(&self.role) = role;
    }

    pub fn is_primary(&self) -> bool {
        self.role() == SessionRole::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.role() == SessionRole::Secondary
    }

    pub fn is_draining(&self) -> bool {
        self.role() == SessionRole::Draining
    }

    pub fn is_healthy(&self) -> bool {
        relock(&self.health).is_healthy()
    }

    pub fn set_healthy(&self, healthy: bool) {
        relock(&self.health).set_healthy(healthy);
    }

    pub fn record_pong(&self, rtt: Duration) {
        relock(&self.health).record_pong(rtt);
    }

    pub fn record_miss(&self) -> u32 {
        relock(&self.health).record_miss()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        relock(&self.health).last_rtt
    }

    /// Whether the transport has closed underneath us.
    pub fn is_closed(&self) -> bool {
        self.transport.close_reason().is_some()
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.started_at.elapsed())
    }

    /// Write a shutdown opcode on the control stream.
    pub async fn send_shutdown(&self) -> std::io::Result<()> {
        let mut tx = self.control_tx.lock().await;
        control::write_frame(&mut *tx, ControlFrame::Shutdown).await
    }

    /// Finish the control stream. Idempotent; errors are ignored since
    /// the stream may already be gone.
    pub async fn close_control(&self) {
        let mut tx = self.control_tx.lock().await;
        let _ = tx.finish();
    }

    /// Close the transport and its listener with a clean code.
    pub fn close(&self, reason: &[u8]) {
        self.transport.close(VarInt::from_u32(0), reason);
        self.endpoint.close(VarInt::from_u32(0), reason);
        debug!(session = %self.id, "transport closed");
    }

    /// Snapshot for observability.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            role: self.role(),
            healthy: self.is_healthy(),
            remaining_ttl: self.remaining_ttl(),
            last_rtt: self.last_rtt(),
            peer_public_ip: self.peer_public_ip.clone(),
        }
    }
}

/// Point-in-time view of one session, for telemetry logging.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub role: SessionRole,
    pub healthy: bool,
    pub remaining_ttl: Duration,
    pub last_rtt: Option<Duration>,
    pub peer_public_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn session_ids_are_hex_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = generate_session_id().expect("id generation must succeed");
            assert_eq!(id.len(), 16);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id), "session id collision");
        }
    }

    #[test]
    fn three_misses_flip_health_not_two() {
        let mut health = HealthState::new();
        assert!(health.is_healthy());

        assert_eq!(health.record_miss(), 1);
        assert!(health.is_healthy());
        assert_eq!(health.record_miss(), 2);
        assert!(health.is_healthy());
        assert_eq!(health.record_miss(), 3);
        assert!(!health.is_healthy());
    }

    #[test]
    fn pong_resets_miss_counter() {
        let mut health = HealthState::new();
        health.record_miss();
        health.record_miss();
        health.record_pong(Duration::from_millis(12));

        assert!(health.is_healthy());
        assert_eq!(health.last_rtt, Some(Duration::from_millis(12)));
        // The counter restarted: two more misses do not flip health.
        health.record_miss();
        health.record_miss();
        assert!(health.is_healthy());
    }

    #[test]
    fn role_display_matches_labels() {
        assert_eq!(SessionRole::Primary.to_string(), "primary");
        assert_eq!(SessionRole::Secondary.to_string(), "secondary");
        assert_eq!(SessionRole::Draining.to_string(), "draining");
    }
}
