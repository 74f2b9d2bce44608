//! # Transport Server
//!
//! Turns the punched UDP port into an encrypted stream-multiplexing
//! transport. The punch installed NAT state for one specific
//! `(address, port)` pair, so the listener must reuse exactly that port:
//! the punching socket is dropped, a short release delay elapses, and a
//! QUIC endpoint is bound to the same local address.
//!
//! The daemon accepts exactly one incoming connection per session. Peer
//! identity is "whoever successfully dialed the punched path": the
//! worker does not validate our self-signed certificate and we do not
//! request one from it. Once the connection is up, the accepting side
//! opens the control stream; that ordering is part of the wire contract.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use quinn::{Connection, Endpoint, IdleTimeout, RecvStream, SendStream, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ModeProfile, HANDSHAKE_TIMEOUT, SOCKET_RELEASE_DELAY};
use crate::error::LaunchError;

/// ALPN protocol identifier expected by the worker.
pub const ALPN: &[u8] = b"h3";

/// Certificate subject organization.
const CERT_ORGANIZATION: &str = "Orchestrator";

/// Certificate subject alternative name the worker dials by convention.
const CERT_SAN: &str = "orchestrator.local";

/// Certificate validity period in days.
const CERT_VALIDITY_DAYS: i64 = 365;

/// Per-stream flow-control window at the 8 KiB buffer baseline.
const BASE_STREAM_WINDOW: u64 = 16 * 1024 * 1024;

/// Per-connection flow-control window at the 8 KiB buffer baseline.
const BASE_CONNECTION_WINDOW: u64 = 64 * 1024 * 1024;

/// Buffer size the flow-control windows are calibrated against.
const BASE_BUFFER_SIZE: f64 = 8.0 * 1024.0;

/// Shared rustls provider. ring is the only provider compiled in.
static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Scale the flow-control windows linearly from the mode's buffer size.
pub fn scaled_windows(buffer_size: usize) -> (u64, u64) {
    let scale = (buffer_size as f64 / BASE_BUFFER_SIZE).max(1.0);
    (
        (BASE_STREAM_WINDOW as f64 * scale) as u64,
        (BASE_CONNECTION_WINDOW as f64 * scale) as u64,
    )
}

/// Generate a fresh self-signed certificate for one session.
fn generate_session_cert(
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), LaunchError> {
    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| LaunchError::Tls(format!("key generation failed: {}", e)))?;

    let mut params = rcgen::CertificateParams::new(vec![CERT_SAN.to_string()])
        .map_err(|e| LaunchError::Tls(format!("certificate params: {}", e)))?;
    params.distinguished_name.push(
        rcgen::DnType::OrganizationName,
        rcgen::DnValue::Utf8String(CERT_ORGANIZATION.to_string()),
    );
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(CERT_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| LaunchError::Tls(format!("self-signing failed: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert_der, key_der))
}

/// Build the QUIC server configuration for one session, scaled by mode.
pub fn server_config(profile: &ModeProfile) -> Result<quinn::ServerConfig, LaunchError> {
    let (cert, key) = generate_session_cert()?;

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| LaunchError::Tls(format!("protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| LaunchError::Tls(format!("server TLS config: {}", e)))?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .map_err(|e| LaunchError::Tls(format!("QUIC server config: {}", e)))?,
    ));

    let (stream_window, connection_window) = scaled_windows(profile.buffer_size);
    let transport = Arc::get_mut(&mut config.transport)
        .expect("transport config is exclusively owned immediately after creation");
    transport.stream_receive_window(
        VarInt::from_u64(stream_window).expect("stream window fits in a varint"),
    );
    transport.receive_window(
        VarInt::from_u64(connection_window).expect("connection window fits in a varint"),
    );
    transport.max_concurrent_bidi_streams(VarInt::from_u32(profile.max_streams));
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(profile.idle_timeout).expect("idle timeout is a valid varint"),
    ));
    transport.keep_alive_interval(Some(profile.keep_alive));

    Ok(config)
}

/// Rebind the punched local address and accept the worker's connection.
///
/// The caller must have dropped the punching socket already. Waits out
/// the release delay, binds the transport listener on the same address,
/// accepts exactly one connection within [`HANDSHAKE_TIMEOUT`], and opens
/// the control stream on it. Cancellation closes the listener promptly.
pub async fn accept_on_punched_port(
    local_addr: SocketAddr,
    profile: &ModeProfile,
    cancel: &CancellationToken,
) -> Result<(Endpoint, Connection, SendStream, RecvStream), LaunchError> {
    sleep(SOCKET_RELEASE_DELAY).await;

    let config = server_config(profile)?;
    let endpoint = Endpoint::server(config, local_addr)
        .map_err(|e| LaunchError::PortRebind(format!("{}: {}", local_addr, e)))?;

    debug!(%local_addr, "transport listener bound on punched port");

    let accept_one = async {
        match endpoint.accept().await {
            Some(incoming) => incoming
                .await
                .map_err(|e| LaunchError::Tls(format!("handshake failed: {}", e))),
            None => Err(LaunchError::AcceptCancelled),
        }
    };

    let connection = tokio::select! {
        _ = cancel.cancelled() => {
            endpoint.close(VarInt::from_u32(0), b"cancelled");
            return Err(LaunchError::AcceptCancelled);
        }
        accepted = timeout(HANDSHAKE_TIMEOUT, accept_one) => match accepted {
            Ok(result) => result?,
            Err(_) => {
                endpoint.close(VarInt::from_u32(0), b"accept timeout");
                return Err(LaunchError::AcceptTimeout);
            }
        }
    };

    info!(remote = %connection.remote_address(), "worker connected on punched port");

    let (control_tx, control_rx) = connection
        .open_bi()
        .await
        .map_err(|e| LaunchError::ControlStream(e.to_string()))?;

    Ok((endpoint, connection, control_tx, control_rx))
}
