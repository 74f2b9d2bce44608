//! Shared helpers for integration tests: a loopback QUIC session pair
//! (daemon side + worker side) and a stub launcher that hands the
//! connection manager real sessions without STUN, the rendezvous store,
//! or hole punching.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use cirrus::control::{self, ControlFrame};
use cirrus::launcher::{spawn_keepalive, Launch};
use cirrus::session::{generate_session_id, Session, SessionRole};
use cirrus::socks5::read_flow_request;
use cirrus::splice::{splice, StreamConn};
use cirrus::{Config, LaunchError, OperatingMode};

/// Worker side of an established loopback session.
pub struct WorkerHandle {
    pub connection: quinn::Connection,
    // Keeps the worker's endpoint driver alive for the test's duration.
    endpoint: quinn::Endpoint,
}

/// Accept-any-certificate verifier for the worker side of tests. The
/// production trust model is the same: the peer is identified by having
/// connected on the punched path at all.
#[derive(Debug)]
struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn worker_endpoint() -> quinn::Endpoint {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("TLS 1.3 must be supported")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![b"h3".to_vec()];

    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .expect("client crypto must convert"),
    ));

    let mut endpoint =
        quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).expect("client endpoint binds");
    endpoint.set_default_client_config(client_config);
    endpoint
}

/// Establish a real loopback QUIC session: daemon-side server endpoint
/// plus worker-side client. Returns the daemon [`Session`], the
/// daemon-side control receive half (for the keepalive), and the worker
/// handle.
pub async fn establish_session(
    role: SessionRole,
    ttl: Duration,
    cancel: CancellationToken,
) -> (Arc<Session>, RecvStream, WorkerHandle) {
    let profile = OperatingMode::Test.profile();
    let server_config = cirrus::transport::server_config(&profile).expect("server config");
    let server_endpoint =
        quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap())
            .expect("server endpoint binds");
    let server_addr = server_endpoint.local_addr().unwrap();

    let worker_ep = worker_endpoint();
    let connect = worker_ep
        .connect(server_addr, "orchestrator.local")
        .expect("connect initiates");

    let (worker_conn, incoming) = tokio::join!(connect, async {
        server_endpoint
            .accept()
            .await
            .expect("one incoming connection")
            .await
    });
    let worker_conn = worker_conn.expect("worker handshake");
    let daemon_conn = incoming.expect("daemon handshake");

    // The accepting side opens the control stream.
    let (control_tx, control_rx) = daemon_conn.open_bi().await.expect("control stream opens");

    let session = Arc::new(Session::new(
        generate_session_id().unwrap(),
        server_endpoint,
        daemon_conn,
        control_tx,
        role,
        ttl,
        "198.51.100.5".to_string(),
        cancel,
    ));

    let worker = WorkerHandle {
        connection: worker_conn,
        endpoint: worker_ep,
    };
    (session, control_rx, worker)
}

/// Worker-side control loop: answers every ping with a matching pong.
/// Records the session id into `shutdowns` if a shutdown opcode arrives.
pub fn spawn_pong_responder(
    connection: quinn::Connection,
    session_id: String,
    shutdowns: Arc<Mutex<Vec<String>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // The control stream surfaces here once the daemon first writes
        // on it.
        let Ok((mut tx, mut rx)) = connection.accept_bi().await else {
            return;
        };
        loop {
            match control::read_frame(&mut rx).await {
                Ok(ControlFrame::Ping { nonce }) => {
                    if control::write_frame(&mut tx, ControlFrame::Pong { nonce })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(ControlFrame::Shutdown) => {
                    shutdowns.lock().unwrap().push(session_id);
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    })
}

/// Worker-side flow loop: serves every accepted stream as one proxied
/// flow, dialing the requested target directly.
pub fn spawn_flow_worker(connection: quinn::Connection) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((send, recv)) = connection.accept_bi().await {
            tokio::spawn(serve_flow(send, recv));
        }
    })
}

async fn serve_flow(mut send: SendStream, mut recv: RecvStream) {
    let Ok(target) = read_flow_request(&mut recv).await else {
        return;
    };
    match TcpStream::connect(&target).await {
        Ok(tcp) => {
            if send.write_all(&[0x00]).await.is_err() {
                return;
            }
            splice(
                tcp,
                StreamConn::new(send, recv),
                8 * 1024,
                CancellationToken::new(),
                None,
            )
            .await;
        }
        Err(_) => {
            let _ = send.write_all(&[0x01]).await;
        }
    }
}

/// How a stub session's background machinery should run.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StubMode {
    /// Keepalive + pong responder (rotation and health tests).
    Keepalive,
    /// No keepalive; the worker serves proxied flows (SOCKS5 tests).
    Flows,
}

/// A launcher that produces real loopback sessions instantly.
pub struct StubLauncher {
    ttl: Duration,
    mode: StubMode,
    pub launched: AtomicU32,
    /// Session ids whose workers observed a shutdown opcode.
    pub shutdowns: Arc<Mutex<Vec<String>>>,
}

impl StubLauncher {
    pub fn new(ttl: Duration, mode: StubMode) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            mode,
            launched: AtomicU32::new(0),
            shutdowns: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl Launch for StubLauncher {
    async fn launch(&self, cancel: CancellationToken) -> Result<Arc<Session>, LaunchError> {
        let (session, control_rx, worker) =
            establish_session(SessionRole::Primary, self.ttl, cancel).await;
        self.launched.fetch_add(1, Ordering::SeqCst);

        match self.mode {
            StubMode::Keepalive => {
                spawn_pong_responder(
                    worker.connection.clone(),
                    session.id.clone(),
                    self.shutdowns.clone(),
                );
                spawn_keepalive(session.clone(), control_rx);
            }
            StubMode::Flows => {
                spawn_flow_worker(worker.connection.clone());
            }
        }

        // Leak the worker handle so its endpoint outlives the launcher
        // call for the duration of the test process.
        std::mem::forget(worker);
        Ok(session)
    }
}

/// A test-mode config with rotation timing compressed for the suite.
pub fn fast_rotation_config(socks5_port: u16) -> Arc<Config> {
    let mut config = Config::new(
        "us-west-2".into(),
        "cirrus-test-rendezvous".into(),
        "127.0.0.1:3478".into(),
        socks5_port,
        OperatingMode::Test,
    );
    config.profile.session_ttl = Duration::from_secs(2);
    config.profile.drain_timeout = Duration::from_secs(1);
    Arc::new(config)
}

/// Unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU32 = AtomicU32::new(42000);

pub fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst) as u16
}
