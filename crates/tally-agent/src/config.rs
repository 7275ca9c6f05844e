//! Agent configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! command-line flags and environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use tally_core::parse_duration;

use crate::error::{AgentError, Result};

/// Which wire protocol the agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// gzip JSON batch on `POST /updates/`.
    #[default]
    Http,
    /// `UpdateMetrics` frame on `POST /rpc`.
    Rpc,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "rpc" => Ok(Self::Rpc),
            other => Err(format!("unknown transport '{other}', expected http or rpc")),
        }
    }
}

/// Resolved agent configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Server address, `host:port` or a full URL.
    pub address: String,
    /// Interval between collections.
    pub poll_interval: Duration,
    /// Interval between report attempts.
    pub report_interval: Duration,
    /// HMAC key for payload signatures.
    pub key: Option<String>,
    /// Pacing tokens minted per second.
    pub rate_limit: u32,
    /// Maximum concurrent deliveries.
    pub max_in_flight: usize,
    /// Path to the server's RSA public key.
    pub crypto_key: Option<PathBuf>,
    /// Wire protocol.
    pub transport: TransportKind,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            key: None,
            rate_limit: 1,
            max_in_flight: 1,
            crypto_key: None,
            transport: TransportKind::Http,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Create a configuration targeting the given server address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the collection interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the report interval.
    #[must_use]
    pub const fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Set the pacing rate.
    #[must_use]
    pub const fn with_rate_limit(mut self, rate: u32) -> Self {
        self.rate_limit = rate;
        self
    }

    /// Set the number of delivery slots.
    #[must_use]
    pub const fn with_max_in_flight(mut self, slots: usize) -> Self {
        self.max_in_flight = slots;
        self
    }

    /// Set the HMAC signing key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the transport.
    #[must_use]
    pub const fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Resolve the configuration from defaults, the JSON file named by
    /// `args.config` (if any) and the remaining flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any value is invalid.
    pub fn load(args: &AgentArgs) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = &args.config {
            config.apply_file(&AgentFileConfig::from_file(path)?)?;
        }
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: &AgentFileConfig) -> Result<()> {
        if let Some(address) = file.address.as_ref().filter(|a| !a.is_empty()) {
            self.address.clone_from(address);
        }
        if let Some(poll) = &file.poll_interval {
            self.poll_interval = parse_duration(poll)
                .map_err(|e| AgentError::Config(format!("invalid poll_interval: {e}")))?;
        }
        if let Some(report) = &file.report_interval {
            self.report_interval = parse_duration(report)
                .map_err(|e| AgentError::Config(format!("invalid report_interval: {e}")))?;
        }
        if let Some(rate) = file.rate_limit {
            self.rate_limit = rate;
        }
        if let Some(slots) = file.max_in_flight {
            self.max_in_flight = slots;
        }
        if let Some(path) = &file.crypto_key {
            self.crypto_key = Some(path.clone());
        }
        if let Some(transport) = file.transport {
            self.transport = transport;
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &AgentArgs) {
        if let Some(address) = &args.address {
            self.address.clone_from(address);
        }
        if let Some(poll) = args.poll_interval {
            self.poll_interval = poll;
        }
        if let Some(report) = args.report_interval {
            self.report_interval = report;
        }
        if let Some(key) = args.key.as_ref().filter(|k| !k.is_empty()) {
            self.key = Some(key.clone());
        }
        if let Some(rate) = args.rate_limit {
            self.rate_limit = rate;
        }
        if let Some(slots) = args.max_in_flight {
            self.max_in_flight = slots;
        }
        if let Some(path) = &args.crypto_key {
            self.crypto_key = Some(path.clone());
        }
        if let Some(transport) = args.transport {
            self.transport = transport;
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(AgentError::Config("address cannot be empty".to_string()));
        }

        if self.poll_interval.is_zero() {
            return Err(AgentError::Config(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.report_interval.is_zero() {
            return Err(AgentError::Config(
                "report_interval must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit == 0 {
            return Err(AgentError::Config(
                "rate_limit must be greater than 0".to_string(),
            ));
        }

        if self.max_in_flight == 0 {
            return Err(AgentError::Config(
                "max_in_flight must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the base URL of the server.
    #[must_use]
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        }
    }
}

/// Shape of the optional JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentFileConfig {
    /// Server address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Collection interval, e.g. `"2s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    /// Report interval, e.g. `"10s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<String>,
    /// Pacing rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    /// Delivery slots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    /// Public key path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,
    /// Transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
}

impl AgentFileConfig {
    /// Load a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AgentError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse a JSON config document.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| AgentError::Config(format!("invalid JSON: {e}")))
    }

    /// A sample file with every field populated from the defaults.
    #[must_use]
    pub fn sample() -> Self {
        let defaults = AgentConfig::default();
        Self {
            address: Some(defaults.address),
            poll_interval: Some(format!("{}s", defaults.poll_interval.as_secs())),
            report_interval: Some(format!("{}s", defaults.report_interval.as_secs())),
            rate_limit: Some(defaults.rate_limit),
            max_in_flight: Some(defaults.max_in_flight),
            crypto_key: None,
            transport: Some(defaults.transport),
        }
    }
}

/// Command-line and environment overrides.
#[derive(Debug, Clone, Default, Args)]
pub struct AgentArgs {
    /// Path to a JSON config file
    #[arg(short = 'c', long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Server address (host:port)
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Collection interval (e.g. 2s, 500ms; bare numbers are seconds)
    #[arg(short = 'p', long, env = "POLL_INTERVAL", value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Report interval
    #[arg(short = 'r', long, env = "REPORT_INTERVAL", value_parser = parse_duration)]
    pub report_interval: Option<Duration>,

    /// HMAC-SHA256 signing key
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Pacing tokens per second
    #[arg(short = 'l', long, env = "RATE_LIMIT")]
    pub rate_limit: Option<u32>,

    /// Maximum concurrent deliveries
    #[arg(short = 'w', long, env = "MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,

    /// Path to the server's RSA public key (PEM)
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Wire protocol: http or rpc
    #[arg(long, env = "TRANSPORT")]
    pub transport: Option<TransportKind>,
}
