//! Agent binary: dials out to a relay's control connection, then opens
//! a local connection and a transfer connection for each tunnel the
//! relay asks it to forward.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use portbridge_agent::{Agent, AgentConfig};
use portbridge_cert::MutualTlsMaterial;
use portbridge_connectivity::{ConnectionFactory, TcpConnectionFactory, TlsConnectionFactory};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverse-tunnel agent: dials a relay and forwards its traffic to a local service.
#[derive(Parser, Debug)]
#[command(name = "portbridge")]
#[command(version)]
struct Args {
    /// Network type for the control connection (tcp, tcp4, tcp6).
    #[arg(long, env = "APP_CONTROL_CONN_NET_TYPE", default_value = "tcp")]
    control_conn_net_type: String,

    /// Relay address to dial for the control connection.
    #[arg(long, env = "APP_CONTROL_CONN_ADDR", default_value = ":9001")]
    control_conn_addr: String,

    /// Delay before redialing the control connection after it is lost, in milliseconds.
    #[arg(long, env = "APP_CONTROL_CONN_RESET_INTERVAL", default_value_t = 1000)]
    control_conn_reset_interval: u64,

    /// Interval between keep-alive pings sent to the relay, in milliseconds.
    #[arg(long, env = "APP_CONTROL_CONN_PING_INTERVAL", default_value_t = 30_000)]
    control_conn_ping_interval: u64,

    /// How long to wait for control-socket reads/writes before giving up, in milliseconds.
    #[arg(long, env = "APP_CONTROL_CONN_PING_TIMEOUT", default_value_t = 45_000)]
    control_conn_ping_timeout: u64,

    /// Network type for transfer connections (tcp, tcp4, tcp6).
    #[arg(long, env = "APP_TRANSFER_CONN_NET_TYPE", default_value = "tcp")]
    transfer_conn_net_type: String,

    /// Relay address to dial for each transfer connection.
    #[arg(long, env = "APP_TRANSFER_CONN_ADDR", default_value = ":8888")]
    transfer_conn_addr: String,

    /// Network type for the local service connection (tcp, tcp4, tcp6).
    #[arg(long, env = "APP_LOCAL_CONN_NET_TYPE", default_value = "tcp")]
    local_conn_net_type: String,

    /// Local service address to forward traffic to.
    #[arg(long, env = "APP_LOCAL_CONN_ADDR", default_value = ":80")]
    local_conn_addr: String,

    /// Read buffer size for the local connection, in bytes.
    #[arg(long, env = "APP_BUFFER_SIZE", default_value_t = 512 * 1024)]
    buffer_size: usize,

    /// Verbosity from 0 (silent) to 5 (trace).
    #[arg(long, env = "APP_LOG_LEVEL", default_value_t = 4)]
    log_level: u8,

    /// Use plain TCP for the control and transfer connections instead of mutual TLS.
    #[arg(long, env = "APP_TCP_TRANSFER_CONNS")]
    tcp_transfer_conns: bool,

    /// Root CA certificate (PEM) shared with the relay. Required unless --tcp-transfer-conns.
    #[arg(long, env = "APP_ROOT_CA")]
    root_ca: Option<PathBuf>,

    /// This agent's certificate (PEM), signed by the root CA. Required unless --tcp-transfer-conns.
    #[arg(long, env = "APP_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// This agent's private key (PEM). Required unless --tcp-transfer-conns.
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

type Factories = (Arc<dyn ConnectionFactory>, Arc<dyn ConnectionFactory>, Arc<dyn ConnectionFactory>);

/// Builds the control, transfer, and local connection factories. The
/// local connection always stays plain TCP: it never leaves the host
/// the agent runs on, matching the original's `localConnFactory`,
/// which is never wrapped in `tlsFactory`.
fn build_factories(args: &Args) -> Result<Factories> {
    let local_factory: Arc<dyn ConnectionFactory> = Arc::new(TcpConnectionFactory::new(
        args.local_conn_net_type.clone(),
        args.local_conn_addr.clone(),
    ));

    if args.tcp_transfer_conns {
        return Ok((
            Arc::new(TcpConnectionFactory::new(
                args.control_conn_net_type.clone(),
                args.control_conn_addr.clone(),
            )),
            Arc::new(TcpConnectionFactory::new(
                args.transfer_conn_net_type.clone(),
                args.transfer_conn_addr.clone(),
            )),
            local_factory,
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
        Arc::new(TlsConnectionFactory::new(
            args.control_conn_net_type.clone(),
            args.control_conn_addr.clone(),
            "relay",
            material.clone(),
            false,
        )),
        Arc::new(TlsConnectionFactory::new(
            args.transfer_conn_net_type.clone(),
            args.transfer_conn_addr.clone(),
            "relay",
            material,
            false,
        )),
        local_factory,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.log_level)?;

    let (control_factory, transfer_factory, local_factory) = build_factories(&args)?;
    let reset_interval = Duration::from_millis(args.control_conn_reset_interval);

    let agent_config = AgentConfig {
        ping_interval: Duration::from_millis(args.control_conn_ping_interval),
        ping_timeout: Duration::from_millis(args.control_conn_ping_timeout),
        buffer_size_bytes: args.buffer_size,
    };

    tracing::info!(address = %args.control_conn_addr, "agent starting, dialing relay");

    loop {
        match control_factory.connect().await {
            Ok(control_stream) => {
                tracing::info!("connected to relay, starting control epoch");
                let agent = Agent::new(local_factory.clone(), transfer_factory.clone(), agent_config.clone());
                agent.run_epoch(control_stream).await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to connect to relay");
            }
        }

        tokio::time::sleep(reset_interval).await;
    }
}
