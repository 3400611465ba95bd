use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use flowmaster::{
    Config, MasterCoordinator, MemoryBackend, PostgresBackend,
    command::SysinfoMetricsCollector,
    observability::{self, ObservabilityOptions},
    rpc::TcpTransport,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "flowmaster-master",
    about = "Run a flowmaster master: claim commands, dispatch tasks, track workflow state"
)]
struct Args {
    /// RPC address to bind, e.g. 0.0.0.0:5678
    #[arg(long)]
    listen_addr: Option<SocketAddr>,
    /// Address registered for this master; defaults to the listen address.
    #[arg(long)]
    advertise_addr: Option<String>,
    /// Log filter directives, e.g. `flowmaster=debug`.
    #[arg(long, env = "FLOWMASTER_LOG")]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        listen_addr,
        advertise_addr,
        log_filter,
    } = Args::parse();
    observability::init(ObservabilityOptions { log_filter });

    let mut config = Config::from_env()?;
    if let Some(listen_addr) = listen_addr {
        config.listen_addr = listen_addr;
        if advertise_addr.is_none() {
            config.advertise_addr = listen_addr.to_string();
        }
    }
    if let Some(advertise_addr) = advertise_addr {
        config.advertise_addr = advertise_addr;
    }

    let transport = Arc::new(TcpTransport::default());
    let collector = Arc::new(SysinfoMetricsCollector::new());
    let master = match config.database_url.clone() {
        Some(url) => {
            let backend = PostgresBackend::connect(&url)
                .await
                .context("failed to connect to postgres")?;
            info!("using postgres backend");
            MasterCoordinator::start(config, Arc::new(backend), transport, collector).await
        }
        None => {
            info!("FLOWMASTER_DATABASE_URL not set, using in-memory backend");
            MasterCoordinator::start(config, Arc::new(MemoryBackend::new()), transport, collector)
                .await
        }
    };
    let master = match master {
        Ok(master) => master,
        Err(err) => {
            error!(?err, "master failed to start");
            return Err(err);
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    master.shutdown().await;
    Ok(())
}
