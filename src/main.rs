pub mod bridge;
pub mod config;
pub mod ingest;
pub mod mqtt;
pub mod shutdown;

use crate::bridge::lifecycle::Bridge;
use crate::config::Cli;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();
    let config = config::resolve(cli)
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;
    info!(
        "Bridging HTTP port {} to broker {}",
        config.listen_addr.port(),
        config.mqtt.broker_url()
    );

    // Broker connection is established before the HTTP listener opens
    let serving = Bridge::create(config)
        .start()
        .await
        .map_err(|e| eyre!("Failed to start bridge: {}", e))?;

    let stopped = serving
        .run_until_shutdown(shutdown::signal())
        .await
        .drain()
        .await
        .map_err(|e| eyre!("Bridge stopped with an error: {}", e))?;

    info!("Published {} messages", stopped.published());
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
