//! Relay (Server) binary: accepts the Agent's control connection, then
//! accepts public client connections and pairs each one with a
//! transfer connection the Agent opens on request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use portbridge_cert::MutualTlsMaterial;
use portbridge_connectivity::{ConnectionFactory, TcpConnectionFactory, TlsConnectionFactory};
use portbridge_relay::{Relay, RelayConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverse-tunnel relay: the publicly reachable half of the tunnel pair.
#[derive(Parser, Debug)]
#[command(name = "portbridge-relay")]
#[command(version)]
struct Args {
    /// Network type for the control listener (tcp, tcp4, tcp6).
    #[arg(long, env = "APP_CONTROL_CONN_NET_TYPE", default_value = "tcp")]
    control_conn_net_type: String,

    /// Address the control listener binds to.
    #[arg(long, env = "APP_CONTROL_CONN_ADDR", default_value = ":9001")]
    control_conn_addr: String,

    /// Delay before accepting the next control connection after one ends, in milliseconds.
    #[arg(long, env = "APP_CONTROL_CONN_RESET_INTERVAL", default_value_t = 1000)]
    control_conn_reset_interval: u64,

    /// Interval between keep-alive pings sent to the agent, in milliseconds.
    #[arg(long, env = "APP_CONTROL_CONN_PING_INTERVAL", default_value_t = 30_000)]
    control_conn_ping_interval: u64,

    /// How long to wait for control-socket reads/writes before giving up, in milliseconds.
    #[arg(long, env = "APP_CONTROL_CONN_PING_TIMEOUT", default_value_t = 45_000)]
    control_conn_ping_timeout: u64,

    /// Network type for the public client listener (tcp, tcp4, tcp6).
    #[arg(long, env = "APP_INCOMING_CONN_NET_TYPE", default_value = "tcp")]
    incoming_conn_net_type: String,

    /// Address the public client listener binds to.
    #[arg(long, env = "APP_INCOMING_CONN_ADDR", default_value = ":80")]
    incoming_conn_addr: String,

    /// Network type for the transfer listener (tcp, tcp4, tcp6).
    #[arg(long, env = "APP_TRANSFER_CONN_NET_TYPE", default_value = "tcp")]
    transfer_conn_net_type: String,

    /// Address the transfer listener binds to.
    #[arg(long, env = "APP_TRANSFER_CONN_ADDR", default_value = ":8888")]
    transfer_conn_addr: String,

    /// Verbosity from 0 (silent) to 5 (trace).
    #[arg(long, env = "APP_LOG_LEVEL", default_value_t = 4)]
    log_level: u8,

    /// Use plain TCP for the control and transfer connections instead of mutual TLS.
    #[arg(long, env = "APP_TCP_TRANSFER_CONNS")]
    tcp_transfer_conns: bool,

    /// Root CA certificate (PEM) shared with the agent. Required unless --tcp-transfer-conns.
    #[arg(long, env = "APP_ROOT_CA")]
    root_ca: Option<PathBuf>,

    /// This relay's certificate (PEM), signed by the root CA. Required unless --tcp-transfer-conns.
    #[arg(long, env = "APP_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// This relay's private key (PEM). Required unless --tcp-transfer-conns.
    #[arg(long, env = "APP_TLS_KEY")]
    tls_key: Option<PathBuf>,
}

fn setup_logging(log_level: u8) -> Result<()> {
    let directive = match log_level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_new(directive).context("invalid log level")?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
    Ok(())
}

type Factories = (
    Arc<dyn ConnectionFactory>,
    Arc<dyn ConnectionFactory>,
    Arc<dyn ConnectionFactory>,
);

/// Builds the client, transfer, and control connection factories. The
/// public client listener always stays plain TCP, matching the
/// original's `incomingCf`, which `server.go` builds unconditionally
/// from the plain TCP factory regardless of `usePlainTcpTransferConns`
/// — only the control and transfer listeners are ever wrapped in
/// mutual TLS.
fn build_factories(args: &Args) -> Result<Factories> {
    let client_factory: Arc<dyn ConnectionFactory> = Arc::new(TcpConnectionFactory::new(
        args.incoming_conn_net_type.clone(),
        args.incoming_conn_addr.clone(),
    ));

    if args.tcp_transfer_conns {
        return Ok((
            client_factory,
            Arc::new(TcpConnectionFactory::new(
                args.transfer_conn_net_type.clone(),
                args.transfer_conn_addr.clone(),
            )),
            Arc::new(TcpConnectionFactory::new(
                args.control_conn_net_type.clone(),
                args.control_conn_addr.clone(),
            )),
        ));
    }

    let root_ca = args
        .root_ca
        .as_ref()
        .context("--root-ca is required unless --tcp-transfer-conns is set")?;
    let tls_cert = args
        .tls_cert
        .as_ref()
        .context("--tls-cert is required unless --tcp-transfer-conns is set")?;
    let tls_key = args
        .tls_key
        .as_ref()
        .context("--tls-key is required unless --tcp-transfer-conns is set")?;
    let material = MutualTlsMaterial::load(root_ca, tls_cert, tls_key)
        .context("failed to load TLS material")?;

    Ok((
        client_factory,
        Arc::new(TlsConnectionFactory::new(
            args.transfer_conn_net_type.clone(),
            args.transfer_conn_addr.clone(),
            "agent",
            material.clone(),
            true,
        )),
        Arc::new(TlsConnectionFactory::new(
            args.control_conn_net_type.clone(),
            args.control_conn_addr.clone(),
            "agent",
            material,
            true,
        )),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.log_level)?;

    let (client_factory, transfer_factory, control_listener_factory) = build_factories(&args)?;
    let control_addr = args.control_conn_addr.clone();

    let relay_config = RelayConfig {
        ping_interval: Duration::from_millis(args.control_conn_ping_interval),
        ping_timeout: Duration::from_millis(args.control_conn_ping_timeout),
    };
    let reset_interval = Duration::from_millis(args.control_conn_reset_interval);

    let mut control_listener = control_listener_factory
        .listen()
        .await
        .with_context(|| format!("failed to bind control listener on {control_addr}"))?;

    tracing::info!(address = %control_addr, "listening for agent control connections");

    loop {
        let control_stream = match control_listener.accept().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(%err, "failed to accept control connection");
                tokio::time::sleep(reset_interval).await;
                continue;
            }
        };
        tracing::info!("agent connected, starting control epoch");

        let relay = Relay::new(client_factory.clone(), transfer_factory.clone(), relay_config.clone());
        relay.run_epoch(control_stream).await;

        tokio::time::sleep(reset_interval).await;
    }
}
