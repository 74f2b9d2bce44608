use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use cirrus::{Config, ConnectionManager, OperatingMode, RendezvousStore, SessionLauncher};

/// Cadence of the session telemetry snapshot log.
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "cirrus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local SOCKS5 listen port.
    #[arg(short, long, env = "CIRRUS_SOCKS5_PORT", default_value = "1080")]
    port: u16,

    /// Binding-reflection (STUN) server as host:port.
    #[arg(
        long,
        env = "CIRRUS_STUN_SERVER",
        default_value = "stun.l.google.com:19302"
    )]
    stun_server: String,

    /// Rendezvous bucket shared with the workers.
    #[arg(short, long, env = "CIRRUS_BUCKET")]
    bucket: String,

    /// Region the rendezvous bucket lives in.
    #[arg(short, long, env = "CIRRUS_REGION", default_value = "us-west-2")]
    region: String,

    /// Operating mode: scales buffers, stream caps, and session TTLs.
    #[arg(short, long, env = "CIRRUS_MODE", value_enum, default_value = "normal")]
    mode: OperatingMode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(Config::new(
        args.region,
        args.bucket,
        args.stun_server,
        args.port,
        args.mode,
    ));
    config.validate().context("invalid configuration")?;

    info!(
        mode = config.mode.as_str(),
        port = config.socks5_port,
        bucket = %config.bucket,
        region = %config.region,
        "starting cirrus daemon"
    );

    let store = RendezvousStore::connect(&config.region, &config.bucket).await;
    let launcher = Arc::new(SessionLauncher::new(config.clone(), store));
    let manager = ConnectionManager::new(config.clone(), launcher);

    let cancel = CancellationToken::new();

    let mut manager_task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.start(cancel).await })
    };

    let socks5_task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        let port = config.socks5_port;
        let buffer_size = config.profile.buffer_size;
        tokio::spawn(async move { cirrus::socks5::serve(port, manager, buffer_size, cancel).await })
    };

    info!(
        "configure your browser to use SOCKS5 proxy: localhost:{}",
        config.socks5_port
    );

    let mut telemetry = time::interval(TELEMETRY_INTERVAL);
    telemetry.tick().await; // skip the immediate tick

    let manager_result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break None;
            }
            finished = &mut manager_task => {
                // The manager only returns early when the initial launch
                // failed or its task died; the daemon cannot serve.
                break Some(finished);
            }
            _ = telemetry.tick() => {
                for session in manager.all_sessions() {
                    info!(
                        session = %session.id,
                        role = %session.role,
                        healthy = session.healthy,
                        remaining_ttl_s = session.remaining_ttl.as_secs(),
                        rtt_ms = session.last_rtt.map(|d| d.as_millis() as u64),
                        peer = %session.peer_public_ip,
                        "session snapshot"
                    );
                }
            }
        }
    };

    cancel.cancel();

    let manager_result = match manager_result {
        Some(finished) => finished,
        None => manager_task.await,
    };
    match manager_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "session management ended with error"),
        Err(e) => error!(error = %e, "session management task died"),
    }

    match socks5_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "SOCKS5 proxy ended with error"),
        Err(e) => error!(error = %e, "SOCKS5 proxy task died"),
    }

    Ok(())
}
