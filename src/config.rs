//! # Daemon Configuration
//!
//! Operating modes and their derived profiles. The daemon reads a mode
//! label plus a handful of endpoints from flags or the environment; the
//! mode resolves to a [`ModeProfile`] that drives buffer sizes, stream
//! caps, session TTLs, and rotation timing. Validation happens once at
//! startup and is fatal on failure.

use std::time::Duration;

use clap::ValueEnum;

use crate::error::ConfigError;

// ============================================================================
// Fixed Timing Constants
// ============================================================================

/// Deadline for the worker reply to appear in the rendezvous store.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall deadline for the hole punch exchange.
pub const PUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the transport handshake after the punch.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of rendezvous-store polling for the worker reply.
pub const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Delay between closing the punch socket and rebinding the port.
/// Environment-dependent: some OSes need longer to release the port.
pub const SOCKET_RELEASE_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Operating Modes
// ============================================================================

/// Operating mode label. Scales the transport and rotation profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperatingMode {
    /// Fast iteration: short sessions, small buffers.
    Test,
    /// Balanced throughput and worker cost.
    Normal,
    /// Streaming-grade buffers and stream caps.
    Performance,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Test => "test",
            OperatingMode::Normal => "normal",
            OperatingMode::Performance => "performance",
        }
    }

    /// Resolve the mode to its full profile.
    pub fn profile(&self) -> ModeProfile {
        match self {
            OperatingMode::Test => ModeProfile {
                session_ttl: Duration::from_secs(90),
                overlap_window: Duration::from_secs(30),
                drain_timeout: Duration::from_secs(15),
                buffer_size: 8 * 1024,
                max_streams: 100,
                keep_alive: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(120),
            },
            OperatingMode::Normal => ModeProfile {
                session_ttl: Duration::from_secs(8 * 60),
                overlap_window: Duration::from_secs(90),
                drain_timeout: Duration::from_secs(45),
                buffer_size: 32 * 1024,
                max_streams: 500,
                keep_alive: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(5 * 60),
            },
            OperatingMode::Performance => ModeProfile {
                session_ttl: Duration::from_secs(12 * 60),
                overlap_window: Duration::from_secs(2 * 60),
                drain_timeout: Duration::from_secs(60),
                buffer_size: 64 * 1024,
                max_streams: 1000,
                keep_alive: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(5 * 60),
            },
        }
    }
}

/// Per-mode tuning applied to sessions and the transport.
#[derive(Debug, Clone)]
pub struct ModeProfile {
    /// Session time-to-live before rotation begins.
    pub session_ttl: Duration,
    /// Trailing portion of the TTL during which a secondary may launch.
    pub overlap_window: Duration,
    /// How long a demoted session keeps serving in-flight flows.
    pub drain_timeout: Duration,
    /// Splice buffer size; also scales transport flow-control windows.
    pub buffer_size: usize,
    /// Maximum concurrent bidirectional streams accepted per session.
    pub max_streams: u32,
    /// Transport keep-alive period.
    pub keep_alive: Duration,
    /// Transport idle timeout.
    pub idle_timeout: Duration,
}

// ============================================================================
// Daemon Configuration
// ============================================================================

/// Complete daemon configuration, validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Region the rendezvous bucket lives in.
    pub region: String,
    /// Rendezvous bucket name.
    pub bucket: String,
    /// Binding-reflection server as `host:port`.
    pub reflector: String,
    /// Local SOCKS5 listen port.
    pub socks5_port: u16,
    /// Operating mode label.
    pub mode: OperatingMode,
    /// Profile derived from `mode`.
    pub profile: ModeProfile,
}

impl Config {
    pub fn new(
        region: String,
        bucket: String,
        reflector: String,
        socks5_port: u16,
        mode: OperatingMode,
    ) -> Self {
        let profile = mode.profile();
        Self {
            region,
            bucket,
            reflector,
            socks5_port,
            mode,
            profile,
        }
    }

    /// Validate the configuration. Any error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socks5_port == 0 {
            return Err(ConfigError::InvalidPort(u32::from(self.socks5_port)));
        }
        if !self.reflector.contains(':') {
            return Err(ConfigError::InvalidReflector(self.reflector.clone()));
        }
        if self.bucket.is_empty() || !is_dns_compliant(&self.bucket) {
            return Err(ConfigError::InvalidBucket(self.bucket.clone()));
        }
        if self.region.is_empty() {
            return Err(ConfigError::EmptyRegion);
        }
        Ok(())
    }
}

/// Bucket names must be lowercase alphanumeric with interior dots/hyphens.
fn is_dns_compliant(name: &str) -> bool {
    if name.len() < 3 || name.len() > 63 {
        return false;
    }
    if name.starts_with('-') || name.ends_with('-') || name.starts_with('.') || name.ends_with('.')
    {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}
