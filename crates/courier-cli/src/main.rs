//! Courier CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use courier_cli::{cli::Cli, config, CommandDispatcher};
use courier_core::{CourierConfig, LogLevel};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = config::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Initialize logging
    setup_logging(&config, cli.verbose);

    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;

    info!("Courier CLI exited successfully");
    Ok(())
}

/// Setup logging from configuration; `--verbose` forces debug output
fn setup_logging(config: &CourierConfig, verbose: bool) {
    let level = if verbose {
        LogLevel::Debug
    } else {
        config.log.level
    };

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(level))
        .with_target(config.log.with_target)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
