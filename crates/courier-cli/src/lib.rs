//! Courier CLI library
//!
//! Command definitions, configuration loading and the in-memory demo driven
//! by the `courier` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use demo::{DemoOptions, DemoReport};
pub use error::{CliError, Result};
