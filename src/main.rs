use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use job_fabric::broker::Broker;
use job_fabric::config::{BrokerConfig, WorkerConfig};
use job_fabric::shutdown::install_shutdown_handler;
use job_fabric::worker::ConnectionManager;

#[derive(Parser, Debug)]
#[command(name = "job-fabric")]
#[command(version)]
#[command(about = "A broker/worker job fabric over WebSocket")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the broker: accept workers and route API job requests to them
    Broker {
        /// Path to the broker configuration file (JSON)
        #[arg(long, short = 'c', default_value = "broker.json")]
        config: PathBuf,

        /// Override the port from the configured listen address
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a worker: connect to a broker and execute configured jobs
    Worker {
        /// Path to the worker configuration file (JSON)
        #[arg(long, short = 'c', default_value = "worker.json")]
        config: PathBuf,
    },
}

async fn run_broker(config: PathBuf, port: Option<u16>) -> job_fabric::Result<()> {
    let mut config = BrokerConfig::load(&config)?;
    if let Some(port) = port {
        config.listen_addr.set_port(port);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        broker_name = %config.broker_name,
        "Starting broker"
    );

    let shutdown = install_shutdown_handler()?;
    Broker::new(config).run(shutdown).await
}

async fn run_worker(config: PathBuf) -> job_fabric::Result<()> {
    let config = WorkerConfig::load(&config)?;

    tracing::info!(
        broker_url = %config.broker_url,
        jobs = config.jobs.len(),
        "Starting worker"
    );

    let shutdown = install_shutdown_handler()?;
    ConnectionManager::new(config).run(shutdown).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Broker { config, port } => run_broker(config, port).await?,
        Commands::Worker { config } => run_worker(config).await?,
    }

    Ok(())
}
