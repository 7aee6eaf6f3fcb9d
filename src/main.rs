//! Powerplant - Main Application

use clap::Parser;
use powerplant::crypto::CANONICAL_VERSION;
use powerplant::utils::init_logging;
use powerplant::{Args, Config, Error, MiningServer, Result, APP_NAME, APP_VERSION};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    init_logging(config.logging.level, config.logging.format);
    info!(
        "Starting {} v{} (canonical serialization v{})",
        APP_NAME, APP_VERSION, CANONICAL_VERSION
    );
    info!(
        "Configuration: threads={}, batch_size={}, difficulty={}..={}, max_connections={}",
        config.pow.threads,
        config.pow.batch_size,
        config.pow.default_difficulty,
        config.pow.max_difficulty,
        config.server.max_connections
    );

    let server = MiningServer::bind(&config).await?;
    server.run(shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml =
        serde_yaml::to_string(config).map_err(|e| Error::config(e.to_string()))?;
    println!("{}", config_yaml);
    Ok(())
}
