//! # Error Taxonomies
//!
//! Typed errors for the two places where callers branch on the failure
//! kind: configuration validation (fatal at startup) and the session
//! launch pipeline (recorded by the manager, feeds launch-gating backoff).
//!
//! Everything else in the crate uses `anyhow` at the seams, with these
//! enums as the typed core that `anyhow` wraps.

use std::fmt;

// ============================================================================
// Launch Pipeline Errors
// ============================================================================

/// Failure of a single session launch attempt.
///
/// The manager records the failure, the launch gate extends its cooldown,
/// and the next monitor tick may retry. A launch error never tears down
/// other sessions.
#[derive(Debug)]
pub enum LaunchError {
    /// The binding-reflection probe failed (timeout, network error, or a
    /// reply without a mapped address).
    Discovery(String),
    /// The rendezvous bucket does not exist.
    StoreMissing(String),
    /// The object store rejected our credentials.
    AccessDenied(String),
    /// A retryable object-store failure.
    StoreTransient(String),
    /// The worker reply did not appear before the deadline.
    ReplyTimeout,
    /// No matching punch datagram arrived before the deadline.
    PunchTimeout,
    /// Re-binding the punched port as the transport listener failed.
    PortRebind(String),
    /// TLS or transport configuration failed.
    Tls(String),
    /// The worker did not dial the punched port in time.
    AcceptTimeout,
    /// The launch context was cancelled while waiting for the worker.
    AcceptCancelled,
    /// The accepted connection died before the control stream opened.
    ControlStream(String),
    /// The launch context was cancelled elsewhere in the pipeline.
    Cancelled,
    /// A local failure that is not expected in practice (socket bind,
    /// randomness, malformed worker data).
    Internal(String),
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::Discovery(msg) => write!(f, "public endpoint discovery failed: {}", msg),
            LaunchError::StoreMissing(bucket) => {
                write!(f, "rendezvous bucket '{}' does not exist", bucket)
            }
            LaunchError::AccessDenied(bucket) => {
                write!(f, "access denied to rendezvous bucket '{}'", bucket)
            }
            LaunchError::StoreTransient(msg) => write!(f, "object store failure: {}", msg),
            LaunchError::ReplyTimeout => write!(f, "timeout waiting for worker reply"),
            LaunchError::PunchTimeout => write!(f, "hole punching timeout"),
            LaunchError::PortRebind(msg) => write!(f, "failed to rebind punched port: {}", msg),
            LaunchError::Tls(msg) => write!(f, "transport TLS setup failed: {}", msg),
            LaunchError::AcceptTimeout => write!(f, "timeout waiting for worker connection"),
            LaunchError::AcceptCancelled => write!(f, "transport accept cancelled"),
            LaunchError::ControlStream(msg) => {
                write!(f, "failed to open control stream: {}", msg)
            }
            LaunchError::Cancelled => write!(f, "launch cancelled"),
            LaunchError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for LaunchError {}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration rejected at startup. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SOCKS5 port outside the usable range.
    InvalidPort(u32),
    /// Binding-reflection server is not `host:port`.
    InvalidReflector(String),
    /// Rendezvous bucket name is empty or not DNS-compliant.
    InvalidBucket(String),
    /// Region label is empty.
    EmptyRegion,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort(port) => {
                write!(f, "SOCKS5 port {} out of range (1-65535)", port)
            }
            ConfigError::InvalidReflector(s) => {
                write!(f, "binding-reflection server '{}' must be host:port", s)
            }
            ConfigError::InvalidBucket(s) => write!(f, "invalid bucket name '{}'", s),
            ConfigError::EmptyRegion => write!(f, "region cannot be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}
