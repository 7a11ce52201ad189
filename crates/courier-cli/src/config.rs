//! Configuration loading for the Courier CLI
//!
//! The file format is the TOML form of [`CourierConfig`]. Every section and
//! field is optional; missing values keep their defaults.

use std::path::Path;

use courier_core::CourierConfig;
use tracing::info;

use crate::error::{CliError, Result};

/// Parse and validate a TOML document
pub fn parse(document: &str) -> Result<CourierConfig> {
    let config: CourierConfig = toml::from_str(document)?;
    config.validate().map_err(CliError::Config)?;
    Ok(config)
}

/// Load configuration from a specific file path
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<CourierConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {}", path.display());
    let document = std::fs::read_to_string(path)?;
    parse(&document)
}

/// Load from `path` when given, otherwise use defaults
pub fn load(path: Option<&str>) -> Result<CourierConfig> {
    match path {
        Some(path) => load_from_file(path),
        None => {
            info!("Using default configuration");
            Ok(CourierConfig::default())
        }
    }
}

pub fn render(config: &CourierConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{FabricKind, LogLevel, OfferPolicy};

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = parse(
            r#"
            [delivery]
            retry = 5

            [backlog.offer_policy]
            policy = "wait"
            timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.delivery.retry, 5);
        assert_eq!(config.backlog.offer_policy, OfferPolicy::Wait { timeout_ms: 250 });
        assert_eq!(config.directory, CourierConfig::default().directory);
    }

    #[test]
    fn test_invalid_document_is_rejected() {
        let result = parse("[backlog]\ncapacity = 0\n");
        assert!(matches!(result, Err(CliError::Config(_))));

        let result = parse("[delivery\nretry = 1");
        assert!(matches!(result, Err(CliError::TomlParsing(_))));
    }

    #[test]
    fn test_rendered_config_parses_back() {
        let mut config = CourierConfig::testing();
        config.fabric.kind = FabricKind::Host;
        config.log.level = LogLevel::Trace;

        let rendered = render(&config).unwrap();
        assert_eq!(parse(&rendered).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let result = load(Some("/nonexistent/courier.toml"));
        assert!(matches!(result, Err(CliError::Io(_))));
        assert_eq!(load(None).unwrap(), CourierConfig::default());
    }
}
