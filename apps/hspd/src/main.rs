use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hsp_connector::{AgentConfig, Connector, ConnectorBuilder, handler_fn};
use hsp_protocol::{Envelope, HspResult};
use hsp_transport::{BrokerServer, TransportFactory};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hspd")]
#[command(about = "Heterogeneous Synchronization Protocol daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the TCP topic broker agents use as their primary transport.
    Broker {
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: SocketAddr,
    },
    /// Connect an agent described by a JSON config and log what it receives.
    Agent {
        #[arg(long)]
        config: PathBuf,
    },
    /// Parse and validate an agent config without connecting.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Broker { listen } => run_broker(listen).await,
        Command::Agent { config } => run_agent(&config).await,
        Command::Check { config } => {
            let config = AgentConfig::load(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_broker(listen: SocketAddr) -> Result<()> {
    let broker = BrokerServer::bind(listen)
        .await
        .with_context(|| format!("binding broker on {listen}"))?
        .spawn()?;
    info!(listen = %broker.local_addr(), "broker ready");
    tokio::signal::ctrl_c().await?;
    broker.shutdown().await;
    Ok(())
}

async fn run_agent(path: &std::path::Path) -> Result<()> {
    let config = AgentConfig::load(path)
        .with_context(|| format!("loading agent config {}", path.display()))?;
    let connector: Connector =
        ConnectorBuilder::from_config(&config, &TransportFactory::new())?.build()?;
    connector.connect().await?;
    info!(
        agent = %connector.agent_id(),
        active = ?connector.active_transport(),
        "agent connected"
    );

    connector
        .subscribe("*", handler_fn(log_envelope))
        .await?;

    tokio::signal::ctrl_c().await?;
    for record in connector.trust().snapshot() {
        info!(peer = %record.peer_id, score = record.score, "trust");
    }
    connector.close().await;
    Ok(())
}

async fn log_envelope(envelope: Arc<Envelope>) -> HspResult<()> {
    info!(
        message_id = %envelope.message_id,
        sender = %envelope.sender_id,
        message_type = %envelope.message_type,
        payload = %envelope.payload,
        "envelope received"
    );
    Ok(())
}
