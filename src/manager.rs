//! # Connection Manager
//!
//! Owns the rolling set of sessions (at most two: one primary, plus one
//! secondary or draining) and runs the rotation state machine:
//!
//! 1. A monitor tick removes dead sessions and decides when to launch.
//! 2. A secondary launches inside the primary's overlap window.
//! 3. A promotion watcher counts consecutive healthy observations and
//!    swaps roles in one critical section, so dispatch never sees two
//!    primaries or none mid-rotation.
//! 4. The demoted primary drains: in-flight flows keep running on it
//!    until the drain timeout, then it gets a shutdown opcode and is
//!    cancelled.
//!
//! The manager lock is held only for inspection and list mutation,
//! never across I/O. Launches run on background tasks gated by
//! [`LaunchState`] so at most one launch of each kind is in flight.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::launcher::Launch;
use crate::session::{Session, SessionInfo, SessionRole};

/// Cadence of the monitor tick.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the promotion watcher's health observations.
const PROMOTION_TICK: Duration = Duration::from_secs(5);

/// Total budget for promoting one secondary.
const PROMOTION_BUDGET: Duration = Duration::from_secs(45);

/// Consecutive healthy observations required before promotion.
const PROMOTION_HEALTHY_STREAK: u32 = 3;

/// Grace period between the shutdown opcode and cancelling a drained
/// session, giving the worker a moment to exit cleanly.
const DRAIN_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Poll cadence of `wait_for_session`.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded wait for background tasks at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Hard cap on concurrently held sessions.
const MAX_SESSIONS: usize = 2;

// ============================================================================
// Launch Gating
// ============================================================================

/// Which kind of session a launch would produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchKind {
    Primary,
    Secondary,
}

impl LaunchKind {
    fn base_cooldown(self) -> Duration {
        match self {
            LaunchKind::Primary => Duration::from_secs(5),
            LaunchKind::Secondary => Duration::from_secs(2),
        }
    }
}

/// Guards concurrent launches: at most one in-flight launch per kind,
/// with a cooldown that stretches under consecutive failures.
#[derive(Debug, Default)]
struct LaunchState {
    launching_primary: bool,
    launching_secondary: bool,
    last_attempt_at: Option<Instant>,
    consecutive_failures: u32,
}

impl LaunchState {
    /// Try to claim a launch slot. On success the in-flight flag is set
    /// and the attempt timestamp recorded; the caller must pair this
    /// with [`LaunchState::finish`].
    fn try_begin(&mut self, kind: LaunchKind, now: Instant) -> bool {
        let in_flight = match kind {
            LaunchKind::Primary => self.launching_primary,
            LaunchKind::Secondary => self.launching_secondary,
        };
        if in_flight {
            return false;
        }

        let mut cooldown = kind.base_cooldown();
        if self.consecutive_failures > 2 {
            cooldown *= self.consecutive_failures;
        }
        if let Some(last) = self.last_attempt_at {
            if now.duration_since(last) < cooldown {
                return false;
            }
        }

        match kind {
            LaunchKind::Primary => self.launching_primary = true,
            LaunchKind::Secondary => self.launching_secondary = true,
        }
        self.last_attempt_at = Some(now);
        true
    }

    /// Release a launch slot and record the outcome.
    fn finish(&mut self, kind: LaunchKind, success: bool) {
        match kind {
            LaunchKind::Primary => self.launching_primary = false,
            LaunchKind::Secondary => self.launching_secondary = false,
        }
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Recover a sync lock even if a panicking task poisoned it.
fn relock<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ConnectionManager {
    config: Arc<Config>,
    launcher: Arc<dyn Launch>,
    sessions: Mutex<Vec<Arc<Session>>>,
    launch_state: Mutex<LaunchState>,
    /// Cancelled once, at shutdown; gates all background task spawns.
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ConnectionManager {
    pub fn new(config: Arc<Config>, launcher: Arc<dyn Launch>) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            sessions: Mutex::new(Vec::new()),
            launch_state: Mutex::new(LaunchState::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Launch the initial session, run the monitor, block until `cancel`
    /// fires, then shut everything down.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("starting session management");

        let session = self
            .launcher
            .launch(cancel.child_token())
            .await
            .map_err(|e| anyhow::anyhow!("failed to launch initial session: {}", e))?;
        session.set_role(SessionRole::Primary);
        relock(&self.sessions).push(session);

        let monitor = self.clone();
        let monitor_cancel = cancel.clone();
        self.tracker.spawn(async move {
            monitor.run_monitor(monitor_cancel).await;
        });

        cancel.cancelled().await;
        self.shut_down().await;
        Ok(())
    }

    /// Return the session new flows should dispatch to, if any.
    ///
    /// Preference order: healthy primary, then healthy secondary (the
    /// narrow promotion interval), then any healthy non-draining
    /// session. A draining session is never returned.
    pub fn current(&self) -> Option<Arc<Session>> {
        let sessions = relock(&self.sessions);

        sessions
            .iter()
            .find(|s| s.is_primary() && s.is_healthy())
            .or_else(|| sessions.iter().find(|s| s.is_secondary() && s.is_healthy()))
            .or_else(|| sessions.iter().find(|s| s.is_healthy() && !s.is_draining()))
            .cloned()
    }

    /// Snapshot of every held session, for observability.
    pub fn all_sessions(&self) -> Vec<SessionInfo> {
        relock(&self.sessions).iter().map(|s| s.info()).collect()
    }

    /// Poll for a dispatch-eligible session until one appears or the
    /// deadline elapses.
    pub async fn wait_for_session(&self, deadline: Duration) -> Option<Arc<Session>> {
        let cutoff = Instant::now() + deadline;
        loop {
            if let Some(session) = self.current() {
                return Some(session);
            }
            if Instant::now() >= cutoff {
                return None;
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    // ------------------------------------------------------------------------
    // Monitor
    // ------------------------------------------------------------------------

    async fn run_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.tick(&cancel),
            }
        }
    }

    /// One monitor pass. Holds the session lock only for inspection and
    /// mutation; launches are handed to background tasks.
    fn tick(self: &Arc<Self>, cancel: &CancellationToken) {
        let mut removed = Vec::new();
        let needs_primary;
        let needs_secondary;

        {
            let mut sessions = relock(&self.sessions);
            sessions.retain(|session| {
                if session.is_closed() {
                    info!(session = %session.id, role = %session.role(), "session closed, removing");
                    return false;
                }
                if !session.is_healthy() && !session.is_draining() {
                    info!(session = %session.id, role = %session.role(), "session unhealthy, removing");
                    removed.push(session.clone());
                    return false;
                }
                true
            });

            let primary = sessions.iter().find(|s| s.is_primary());
            let has_secondary = sessions.iter().any(|s| s.is_secondary());
            let below_cap = sessions.len() < MAX_SESSIONS;

            needs_primary = primary.is_none() && below_cap;
            needs_secondary = primary
                .map(|p| p.remaining_ttl() <= self.config.profile.overlap_window)
                .unwrap_or(false)
                && !has_secondary
                && below_cap;
        }

        for session in removed {
            session.cancel.cancel();
        }

        if needs_primary {
            self.try_launch(LaunchKind::Primary, cancel);
        } else if needs_secondary {
            self.try_launch(LaunchKind::Secondary, cancel);
        }
    }

    fn try_launch(self: &Arc<Self>, kind: LaunchKind, cancel: &CancellationToken) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !relock(&self.launch_state).try_begin(kind, Instant::now()) {
            return;
        }

        info!(kind = ?kind, "starting background session launch");
        let manager = self.clone();
        let parent = cancel.clone();
        self.tracker.spawn(async move {
            match kind {
                LaunchKind::Primary => manager.run_primary_launch(parent).await,
                LaunchKind::Secondary => manager.run_secondary_launch(parent).await,
            }
        });
    }

    fn finish_launch(&self, kind: LaunchKind, success: bool) {
        relock(&self.launch_state).finish(kind, success);
    }

    async fn run_primary_launch(self: Arc<Self>, parent: CancellationToken) {
        let session = match self.launcher.launch(parent.child_token()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "primary launch failed");
                self.finish_launch(LaunchKind::Primary, false);
                return;
            }
        };
        session.set_role(SessionRole::Primary);

        let redundant = {
            let mut sessions = relock(&self.sessions);
            if self.shutdown.is_cancelled()
                || sessions.iter().any(|s| s.is_primary())
                || sessions.len() >= MAX_SESSIONS
            {
                true
            } else {
                sessions.push(session.clone());
                false
            }
        };

        if redundant {
            // Another primary appeared while we were launching, or the
            // manager is shutting down. Not a failure; the fresh session
            // is simply surplus.
            info!(session = %session.id, "primary already present, discarding launch");
            session.cancel.cancel();
            session.close_control().await;
            session.close(b"redundant");
            self.finish_launch(LaunchKind::Primary, true);
            return;
        }

        self.finish_launch(LaunchKind::Primary, true);
        info!(session = %session.id, "primary session launched");
    }

    async fn run_secondary_launch(self: Arc<Self>, parent: CancellationToken) {
        let session = match self.launcher.launch(parent.child_token()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "secondary launch failed");
                self.finish_launch(LaunchKind::Secondary, false);
                return;
            }
        };
        session.set_role(SessionRole::Secondary);

        let redundant = {
            let mut sessions = relock(&self.sessions);
            if self.shutdown.is_cancelled()
                || sessions.iter().any(|s| s.is_secondary())
                || sessions.len() >= MAX_SESSIONS
            {
                true
            } else {
                sessions.push(session.clone());
                false
            }
        };

        if redundant {
            info!(session = %session.id, "secondary already present, discarding launch");
            session.cancel.cancel();
            session.close_control().await;
            session.close(b"redundant");
            self.finish_launch(LaunchKind::Secondary, true);
            return;
        }

        let manager = self.clone();
        let secondary = session.clone();
        if !self.shutdown.is_cancelled() {
            self.tracker.spawn(async move {
                manager.watch_for_promotion(secondary).await;
            });
        }

        self.finish_launch(LaunchKind::Secondary, true);
        info!(session = %session.id, "secondary session launched");
    }

    // ------------------------------------------------------------------------
    // Promotion & Drain
    // ------------------------------------------------------------------------

    /// Observe a fresh secondary until it has proven itself healthy for
    /// [`PROMOTION_HEALTHY_STREAK`] consecutive ticks, then promote it.
    /// Oscillating health resets the streak; the budget bounds the whole
    /// attempt.
    async fn watch_for_promotion(self: Arc<Self>, secondary: Arc<Session>) {
        let mut streak = 0u32;
        let mut ticker = interval(PROMOTION_TICK);
        ticker.tick().await; // consume the immediate first tick
        let budget = sleep(PROMOTION_BUDGET);
        tokio::pin!(budget);

        loop {
            tokio::select! {
                _ = &mut budget => {
                    info!(session = %secondary.id, "promotion budget exhausted");
                    return;
                }
                _ = self.shutdown.cancelled() => return,
                _ = secondary.transport.closed() => {
                    info!(session = %secondary.id, "secondary closed before promotion");
                    return;
                }
                _ = ticker.tick() => {
                    if secondary.is_healthy() {
                        streak += 1;
                        debug!(session = %secondary.id, streak, "secondary health observation");
                        if streak >= PROMOTION_HEALTHY_STREAK {
                            self.promote(&secondary);
                            return;
                        }
                    } else {
                        streak = 0;
                    }
                }
            }
        }
    }

    /// Swap roles in one critical section: the secondary becomes primary
    /// and the old primary starts draining. Returns without effect if
    /// the secondary lost its health in the meantime.
    fn promote(self: &Arc<Self>, secondary: &Arc<Session>) {
        let old_primary = {
            let sessions = relock(&self.sessions);

            if !secondary.is_healthy() {
                info!(session = %secondary.id, "secondary no longer healthy, skipping promotion");
                return;
            }

            let old = sessions
                .iter()
                .find(|s| !Arc::ptr_eq(s, secondary) && s.is_primary())
                .cloned();

            secondary.set_role(SessionRole::Primary);
            info!(session = %secondary.id, "promoted to primary");
            if let Some(old) = &old {
                old.set_role(SessionRole::Draining);
                info!(session = %old.id, "demoted to draining");
            }
            old
        };

        if let Some(draining) = old_primary {
            if self.shutdown.is_cancelled() {
                return;
            }
            let drain_timeout = self.config.profile.drain_timeout;
            self.tracker.spawn(async move {
                drain_cleanup(draining, drain_timeout).await;
            });
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    async fn shut_down(&self) {
        info!("beginning graceful shutdown");
        self.shutdown.cancel();

        let sessions: Vec<Arc<Session>> = std::mem::take(&mut *relock(&self.sessions));
        for session in &sessions {
            session.cancel.cancel();
            session.close_control().await;
            session.close(b"shutting down");
        }

        self.tracker.close();
        if timeout(SHUTDOWN_DRAIN, self.tracker.wait()).await.is_err() {
            error!("timeout waiting for background tasks to finish");
        } else {
            info!("all background tasks finished cleanly");
        }
        info!("shutdown complete");
    }
}

/// Retire a draining session: let in-flight flows run until the drain
/// timeout, signal the worker, give it a grace period, then cancel. If
/// the transport closes on its own the cleanup ends early.
async fn drain_cleanup(session: Arc<Session>, drain_timeout: Duration) {
    info!(session = %session.id, timeout_s = drain_timeout.as_secs(), "drain cleanup scheduled");

    tokio::select! {
        _ = session.transport.closed() => {
            info!(session = %session.id, "session closed naturally during drain");
        }
        _ = sleep(drain_timeout) => {
            info!(session = %session.id, "drain timeout reached, signalling shutdown");
            if let Err(e) = session.send_shutdown().await {
                warn!(session = %session.id, error = %e, "failed to send shutdown opcode");
            }
            sleep(DRAIN_SHUTDOWN_GRACE).await;
            session.cancel.cancel();
            session.close(b"drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[tokio::test]
    async fn gate_allows_one_launch_per_kind() {
        let mut state = LaunchState::default();
        let t0 = now();

        assert!(state.try_begin(LaunchKind::Primary, t0));
        assert!(!state.try_begin(LaunchKind::Primary, t0 + Duration::from_secs(60)));
        // The secondary slot is independent of the primary slot.
        assert!(state.try_begin(LaunchKind::Secondary, t0 + Duration::from_secs(10)));
        assert!(!state.try_begin(LaunchKind::Secondary, t0 + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn base_cooldown_applies_between_attempts() {
        let mut state = LaunchState::default();
        let t0 = now();

        assert!(state.try_begin(LaunchKind::Primary, t0));
        state.finish(LaunchKind::Primary, true);

        // Too soon: primary cooldown is 5 s.
        assert!(!state.try_begin(LaunchKind::Primary, t0 + Duration::from_secs(4)));
        assert!(state.try_begin(LaunchKind::Primary, t0 + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn failures_stretch_the_cooldown() {
        let mut state = LaunchState::default();
        let mut t = now();

        // Three failed attempts, spaced beyond the base cooldown.
        for _ in 0..3 {
            t += Duration::from_secs(10);
            assert!(state.try_begin(LaunchKind::Primary, t));
            state.finish(LaunchKind::Primary, false);
        }
        assert_eq!(state.consecutive_failures, 3);

        // After the third failure the cooldown is 5 s x 3 = 15 s.
        assert!(!state.try_begin(LaunchKind::Primary, t + Duration::from_secs(14)));
        assert!(state.try_begin(LaunchKind::Primary, t + Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let mut state = LaunchState::default();
        let mut t = now();

        for _ in 0..4 {
            t += Duration::from_secs(60);
            assert!(state.try_begin(LaunchKind::Primary, t));
            state.finish(LaunchKind::Primary, false);
        }
        t += Duration::from_secs(60);
        assert!(state.try_begin(LaunchKind::Primary, t));
        state.finish(LaunchKind::Primary, true);
        assert_eq!(state.consecutive_failures, 0);

        // Back to the base cooldown.
        assert!(state.try_begin(LaunchKind::Primary, t + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn secondary_cooldown_is_shorter() {
        let mut state = LaunchState::default();
        let t0 = now();

        assert!(state.try_begin(LaunchKind::Secondary, t0));
        state.finish(LaunchKind::Secondary, true);

        assert!(!state.try_begin(LaunchKind::Secondary, t0 + Duration::from_millis(1900)));
        assert!(state.try_begin(LaunchKind::Secondary, t0 + Duration::from_secs(2)));
    }
}
