//! # Rendezvous Store
//!
//! Coordination with the worker through a shared S3 bucket. The daemon
//! writes a small JSON object describing its punched public endpoint;
//! the store's event notification wakes the worker, which dials out,
//! discovers its own public endpoint, and writes a reply object. The
//! daemon polls for that reply.
//!
//! Writing the coordination key IS the trigger; no latency bound is
//! assumed beyond the caller-supplied deadline.
//!
//! ## Key Layout
//!
//! - `coordination/{session_id}.json` — daemon → worker
//! - `reply/{session_id}.json` — worker → daemon
//!
//! Objects are consumed immediately; retention is the bucket's own
//! age-based expiration policy.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::REPLY_POLL_INTERVAL;
use crate::error::LaunchError;

/// Worker replies carrying any other status are ignored.
const STATUS_READY: &str = "ready";

/// Coordination object written by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coordination {
    pub session_id: String,
    pub public_ip: String,
    pub public_port: u16,
    pub timestamp: i64,
}

/// Reply object written by the worker once it has punched out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerReply {
    pub session_id: String,
    pub peer_public_ip: String,
    pub peer_public_port: u16,
    pub status: String,
    pub timestamp: i64,
}

impl WorkerReply {
    pub fn is_ready(&self) -> bool {
        self.status == STATUS_READY
    }
}

fn coordination_key(session_id: &str) -> String {
    format!("coordination/{}.json", session_id)
}

fn reply_key(session_id: &str) -> String {
    format!("reply/{}.json", session_id)
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// S3-backed rendezvous store handle. Cheap to clone.
#[derive(Clone)]
pub struct RendezvousStore {
    client: Client,
    bucket: String,
}

impl RendezvousStore {
    /// Build a store for the given region and bucket using the ambient
    /// credential chain.
    pub async fn connect(region: &str, bucket: &str) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: Client::new(&shared),
            bucket: bucket.to_string(),
        }
    }

    /// Build a store from an existing client (used by tests).
    pub fn with_client(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Serialize and store the coordination object, triggering the worker.
    pub async fn put_coordination(
        &self,
        session_id: &str,
        public_ip: &str,
        public_port: u16,
    ) -> Result<(), LaunchError> {
        let coordination = Coordination {
            session_id: session_id.to_string(),
            public_ip: public_ip.to_string(),
            public_port,
            timestamp: unix_timestamp(),
        };
        let body = serde_json::to_vec(&coordination)
            .map_err(|e| LaunchError::StoreTransient(format!("serialize coordination: {}", e)))?;

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(coordination_key(session_id))
            .body(ByteStream::from(body))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(session = session_id, "coordination object written");
                Ok(())
            }
            Err(err) => Err(match err.code() {
                Some("NoSuchBucket") => LaunchError::StoreMissing(self.bucket.clone()),
                Some("AccessDenied") => LaunchError::AccessDenied(self.bucket.clone()),
                _ => LaunchError::StoreTransient(err.to_string()),
            }),
        }
    }

    /// Poll for the worker reply until it appears or the deadline passes.
    ///
    /// A missing key is the expected state while the worker spins up and
    /// is never treated as an error. Replies that are not `ready` or that
    /// fail to deserialize are skipped and polling continues.
    pub async fn await_reply(
        &self,
        session_id: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<WorkerReply, LaunchError> {
        let key = reply_key(session_id);
        let cutoff = Instant::now() + deadline;

        while Instant::now() < cutoff {
            if cancel.is_cancelled() {
                return Err(LaunchError::Cancelled);
            }

            match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(output) => {
                    let data = output
                        .body
                        .collect()
                        .await
                        .map_err(|e| LaunchError::StoreTransient(e.to_string()))?
                        .to_vec();
                    match serde_json::from_slice::<WorkerReply>(&data) {
                        Ok(reply) if reply.is_ready() => {
                            debug!(
                                session = session_id,
                                peer = %reply.peer_public_ip,
                                port = reply.peer_public_port,
                                "worker reply received"
                            );
                            return Ok(reply);
                        }
                        Ok(reply) => {
                            debug!(
                                session = session_id,
                                status = %reply.status,
                                "worker reply not ready yet"
                            );
                        }
                        Err(e) => {
                            debug!(session = session_id, error = %e, "malformed worker reply");
                        }
                    }
                }
                Err(err) => {
                    let not_found = err
                        .as_service_error()
                        .map(|se| se.is_no_such_key())
                        .unwrap_or(false);
                    if !not_found {
                        trace!(session = session_id, error = %err, "reply fetch failed, retrying");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LaunchError::Cancelled),
                _ = sleep(REPLY_POLL_INTERVAL) => {}
            }
        }

        Err(LaunchError::ReplyTimeout)
    }
}
