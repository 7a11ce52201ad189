//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run two peers over an in-memory overlay and exchange mixed envelopes
    Demo {
        /// Number of envelopes to send
        #[arg(short, long, default_value_t = 7)]
        messages: u32,
        /// Override the configured retry budget
        #[arg(short, long)]
        retry: Option<u32>,
        /// Probability that a frame is lost in transit (0.0 - 1.0)
        #[arg(short, long, default_value_t = 0.0)]
        loss: f64,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
}
