mod cli;
mod config;
mod node;

use clap::Parser;
use cli::{Cli, Commands};
use config::{AppConfig, LogFormat};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Install default crypto provider for rustls before any TLS operations
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = run().await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref());
    match &config {
        Ok(config) => init_tracing(&config.log_level, config.log_format),
        Err(_) => init_tracing("info", LogFormat::Text),
    }
    let config = config.map_err(|e| {
        error!("Failed to load config: {}", e);
        e
    })?;
    info!("Configuration loaded");

    match cli.command {
        Some(Commands::Run) | None => {
            node::run_node(config).await?;
        }
        Some(Commands::Check) => {
            node::check(&config)?;
        }
        Some(Commands::GenCerts {
            out,
            nodes,
            password,
        }) => {
            node::generate_certificates(&out, nodes, &password)?;
        }
        Some(Commands::Probe { peer }) => {
            node::probe(&config, &peer).await?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
