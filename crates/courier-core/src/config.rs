//! Configuration for the Courier pipeline
//!
//! Every tunable of the pipeline lives here, grouped per component. All groups
//! are serde-enabled so a whole [`CourierConfig`] can be loaded from TOML.
//! Durations are stored as integer milliseconds or seconds and exposed as
//! [`Duration`] through accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{CourierError, Result};

/// Default values shared by the configuration groups
pub mod defaults {
    /// Resolution and retransmission retry budget
    pub const RETRY: u32 = 3;
    /// Sleep between resolution or retransmission attempts
    pub const RETRY_INTERVAL_MS: u64 = 2_000;
    /// Maximum wait for an overlay channel to open
    pub const CHANNEL_OPEN_TIMEOUT_MS: u64 = 30_000;
    /// Result threshold for remote directory queries
    pub const QUERY_THRESHOLD: u32 = 10;
    /// Wait for overlay connectivity after a remote query
    pub const CONNECTIVITY_WAIT_MS: u64 = 500;
    /// Lifetime of published advertisements
    pub const ADVERTISEMENT_LIFETIME_SECS: u64 = 7_200;
    /// Longest advertisement lifetime accepted (one year)
    pub const MAX_ADVERTISEMENT_LIFETIME_SECS: u64 = 31_536_000;
    /// Backlog queue capacity
    pub const BACKLOG_CAPACITY: usize = 50;
    /// Fixed pool size
    pub const POOL_WORKERS: usize = 8;
    /// Grace period before in-flight units are cancelled on shutdown
    pub const SHUTDOWN_GRACE_MS: u64 = 500;
    /// Frames buffered per inbound session
    pub const SESSION_INBOUND_BUFFER: usize = 64;
}

// ----------------------------------------------------------------------------
// Delivery Configuration
// ----------------------------------------------------------------------------

/// Retry and timing policy of delivery workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Re-resolutions after the first lookup, and retransmissions after the
    /// first send
    pub retry: u32,
    /// Fixed sleep between attempts (in milliseconds)
    pub retry_interval_ms: u64,
    /// Channel open timeout (in milliseconds)
    pub channel_open_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: defaults::RETRY,
            retry_interval_ms: defaults::RETRY_INTERVAL_MS,
            channel_open_timeout_ms: defaults::CHANNEL_OPEN_TIMEOUT_MS,
        }
    }
}

impl DeliveryConfig {
    /// Short intervals for tests
    pub fn testing() -> Self {
        Self {
            retry: defaults::RETRY,
            retry_interval_ms: 20,
            channel_open_timeout_ms: 500,
        }
    }

    /// Fewer, faster attempts
    pub fn low_latency() -> Self {
        Self {
            retry: 1,
            retry_interval_ms: 250,
            channel_open_timeout_ms: 5_000,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_open_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Directory Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Upper bound on answers requested by a remote query
    pub query_threshold: u32,
    /// Wait for connectivity after a remote query (in milliseconds)
    pub connectivity_wait_ms: u64,
    /// Lifetime of the advertisement a peer publishes (in seconds)
    pub advertisement_lifetime_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            query_threshold: defaults::QUERY_THRESHOLD,
            connectivity_wait_ms: defaults::CONNECTIVITY_WAIT_MS,
            advertisement_lifetime_secs: defaults::ADVERTISEMENT_LIFETIME_SECS,
        }
    }
}

impl DirectoryConfig {
    pub fn testing() -> Self {
        Self {
            query_threshold: defaults::QUERY_THRESHOLD,
            connectivity_wait_ms: 5,
            advertisement_lifetime_secs: 60,
        }
    }

    pub fn connectivity_wait(&self) -> Duration {
        Duration::from_millis(self.connectivity_wait_ms)
    }

    pub fn advertisement_lifetime(&self) -> Duration {
        Duration::from_secs(self.advertisement_lifetime_secs)
    }
}

// ----------------------------------------------------------------------------
// Backlog Configuration
// ----------------------------------------------------------------------------

/// What `offer` does when the backlog is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OfferPolicy {
    /// Refuse immediately
    Reject,
    /// Wait up to `timeout_ms` for space, then refuse
    Wait { timeout_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    pub capacity: usize,
    pub offer_policy: OfferPolicy,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::BACKLOG_CAPACITY,
            offer_policy: OfferPolicy::Reject,
        }
    }
}

// ----------------------------------------------------------------------------
// Fabric Configuration
// ----------------------------------------------------------------------------

/// Execution strategy for delivery workers and inbound sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FabricKind {
    /// Pool owned by the peer with a fixed number of concurrent units
    FixedPool { workers: usize },
    /// Units run on the runtime the host application provides
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Grace period before outstanding units are cancelled (in milliseconds)
    pub shutdown_grace_ms: u64,
    pub kind: FabricKind,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: defaults::SHUTDOWN_GRACE_MS,
            kind: FabricKind::FixedPool {
                workers: defaults::POOL_WORKERS,
            },
        }
    }
}

impl FabricConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frames buffered between a channel listener and its session task
    pub inbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbound_buffer: defaults::SESSION_INBOUND_BUFFER,
        }
    }
}

// ----------------------------------------------------------------------------
// Log Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Process-wide verbosity, set once at startup by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Include the module path in each line
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Master configuration consolidating every component group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub delivery: DeliveryConfig,
    pub directory: DirectoryConfig,
    pub backlog: BacklogConfig,
    pub fabric: FabricConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
}

impl CourierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> CourierConfigBuilder {
        CourierConfigBuilder::default()
    }

    /// Millisecond intervals suitable for tests
    pub fn testing() -> Self {
        Self {
            delivery: DeliveryConfig::testing(),
            directory: DirectoryConfig::testing(),
            backlog: BacklogConfig::default(),
            fabric: FabricConfig {
                shutdown_grace_ms: 200,
                kind: FabricKind::FixedPool { workers: 4 },
            },
            session: SessionConfig::default(),
            log: LogConfig {
                level: LogLevel::Debug,
                with_target: false,
            },
        }
    }

    /// Single retry with short waits
    pub fn low_latency() -> Self {
        Self {
            delivery: DeliveryConfig::low_latency(),
            directory: DirectoryConfig {
                connectivity_wait_ms: 100,
                ..DirectoryConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_directory(mut self, directory: DirectoryConfig) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_backlog(mut self, backlog: BacklogConfig) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_fabric(mut self, fabric: FabricConfig) -> Self {
        self.fabric = fabric;
        self
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> core::result::Result<(), String> {
        if self.backlog.capacity == 0 {
            return Err("Backlog capacity cannot be zero".into());
        }
        if let OfferPolicy::Wait { timeout_ms: 0 } = self.backlog.offer_policy {
            return Err("Backlog wait timeout cannot be zero".into());
        }
        if let FabricKind::FixedPool { workers: 0 } = self.fabric.kind {
            return Err("Fixed pool needs at least one worker".into());
        }
        if self.directory.query_threshold == 0 {
            return Err("Directory query threshold cannot be zero".into());
        }
        if self.directory.advertisement_lifetime_secs > defaults::MAX_ADVERTISEMENT_LIFETIME_SECS {
            return Err(format!(
                "Advertisement lifetime cannot exceed {} seconds",
                defaults::MAX_ADVERTISEMENT_LIFETIME_SECS
            ));
        }
        if self.delivery.channel_open_timeout_ms == 0 {
            return Err("Channel open timeout cannot be zero".into());
        }
        if self.session.inbound_buffer == 0 {
            return Err("Session inbound buffer cannot be zero".into());
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CourierConfigBuilder {
    config: CourierConfig,
}

impl CourierConfigBuilder {
    pub fn retry(mut self, retry: u32) -> Self {
        self.config.delivery.retry = retry;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.delivery.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn backlog_capacity(mut self, capacity: usize) -> Self {
        self.config.backlog.capacity = capacity;
        self
    }

    pub fn offer_policy(mut self, policy: OfferPolicy) -> Self {
        self.config.backlog.offer_policy = policy;
        self
    }

    pub fn fabric(mut self, kind: FabricKind) -> Self {
        self.config.fabric.kind = kind;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Finish, rejecting invalid combinations
    pub fn build(self) -> Result<CourierConfig> {
        self.config
            .validate()
            .map_err(CourierError::config_error)?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert_eq!(config.delivery.retry, 3);
        assert_eq!(config.delivery.retry_interval(), Duration::from_secs(2));
        assert_eq!(config.directory.query_threshold, 10);
        assert_eq!(config.directory.connectivity_wait(), Duration::from_millis(500));
        assert_eq!(config.backlog.capacity, 50);
        assert_eq!(config.backlog.offer_policy, OfferPolicy::Reject);
        assert!(config.validate().is_ok());
        assert!(CourierConfig::testing().validate().is_ok());
        assert!(CourierConfig::low_latency().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let result = CourierConfig::builder().backlog_capacity(0).build();
        assert!(matches!(result, Err(CourierError::Configuration { .. })));

        let result = CourierConfig::builder()
            .fabric(FabricKind::FixedPool { workers: 0 })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_bounds_advertisement_lifetime() {
        let mut config = CourierConfig::default();
        config.directory.advertisement_lifetime_secs = u64::MAX;
        assert!(config.validate().is_err());

        config.directory.advertisement_lifetime_secs = defaults::MAX_ADVERTISEMENT_LIFETIME_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_partial_override() {
        let config: CourierConfig = toml::from_str(
            r#"
            [delivery]
            retry = 5

            [backlog]
            capacity = 10
            offer_policy = { policy = "wait", timeout_ms = 250 }

            [fabric]
            kind = { type = "host" }

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.delivery.retry, 5);
        assert_eq!(config.delivery.retry_interval_ms, defaults::RETRY_INTERVAL_MS);
        assert_eq!(config.backlog.capacity, 10);
        assert_eq!(config.backlog.offer_policy, OfferPolicy::Wait { timeout_ms: 250 });
        assert_eq!(config.fabric.kind, FabricKind::Host);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let text = toml::to_string(&CourierConfig::default()).unwrap();
        let parsed: CourierConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, CourierConfig::default());
    }
}
