//! Command handlers for the Courier CLI

use courier_core::CourierConfig;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config;
use crate::demo::{run_demo, DemoOptions};
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CourierConfig) -> Result<()> {
        match cli.command {
            Commands::Demo {
                messages,
                retry,
                loss,
                json,
            } => {
                let options = DemoOptions {
                    messages,
                    retry,
                    loss,
                };
                Self::handle_demo_command(config, options, json).await
            }
            Commands::Config { output } => Self::handle_config_command(&config, output),
        }
    }

    async fn handle_demo_command(config: CourierConfig, options: DemoOptions, json: bool) -> Result<()> {
        if !(0.0..=1.0).contains(&options.loss) {
            return Err(CliError::Config(format!(
                "loss must be between 0.0 and 1.0, got {}",
                options.loss
            )));
        }

        info!("Running demo with {} envelope(s)", options.messages);
        let report = run_demo(&config, &options).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("sent:          {}", report.sent);
            println!("received:      {}", report.received);
            println!("acknowledged:  {}", report.acknowledged);
            println!("reply:         {}", if report.replied { "yes" } else { "no" });
            println!("retransmitted: {}", report.stats.retransmissions);
            println!("dropped:       {}", report.stats.dropped);
        }
        Ok(())
    }

    fn handle_config_command(config: &CourierConfig, output: Option<String>) -> Result<()> {
        let rendered = config::render(config)?;
        match output {
            Some(path) => {
                std::fs::write(&path, rendered)?;
                info!("Configuration written to {}", path);
            }
            None => print!("{}", rendered),
        }
        Ok(())
    }
}
