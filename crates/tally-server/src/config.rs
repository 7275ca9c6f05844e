//! Server configuration.
//!
//! Values are resolved from defaults, then an optional JSON file, then
//! flags and environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use clap::builder::BoolishValueParser;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tally_core::parse_duration;

use crate::error::{Result, ServerError};

/// Default snapshot file.
pub const DEFAULT_FILE_STORAGE_PATH: &str = "tmp/metrics-db.json";

/// Configuration for the tally server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address (`host:port`).
    pub address: String,
    /// Snapshot period; zero means a snapshot after every ingest.
    pub store_interval: Duration,
    /// Snapshot file, used when no database is configured.
    pub file_storage_path: Option<PathBuf>,
    /// Rehydrate the store from the snapshot on startup.
    pub restore: bool,
    /// PostgreSQL connection string.
    pub database_dsn: Option<String>,
    /// HMAC-SHA256 key for request verification and response signing.
    pub key: Option<String>,
    /// File receiving audit events as JSON lines.
    pub audit_file: Option<PathBuf>,
    /// Endpoint receiving audit events via POST.
    pub audit_url: Option<String>,
    /// RSA private key (PEM) for encrypted bodies.
    pub crypto_key: Option<PathBuf>,
    /// Only callers whose `X-Real-IP` falls in this network may ingest.
    pub trusted_subnet: Option<IpNet>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            store_interval: Duration::from_secs(300),
            file_storage_path: Some(PathBuf::from(DEFAULT_FILE_STORAGE_PATH)),
            restore: true,
            database_dsn: None,
            key: None,
            audit_file: None,
            audit_url: None,
            crypto_key: None,
            trusted_subnet: None,
        }
    }
}

impl ServerConfig {
    /// Create a configuration listening on `address` with no persistence.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            file_storage_path: None,
            ..Self::default()
        }
    }

    /// Set the snapshot interval.
    #[must_use]
    pub const fn with_store_interval(mut self, interval: Duration) -> Self {
        self.store_interval = interval;
        self
    }

    /// Set the snapshot file.
    #[must_use]
    pub fn with_file_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_storage_path = Some(path.into());
        self
    }

    /// Enable or disable restore on startup.
    #[must_use]
    pub const fn with_restore(mut self, restore: bool) -> Self {
        self.restore = restore;
        self
    }

    /// Set the database connection string.
    #[must_use]
    pub fn with_database_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.database_dsn = Some(dsn.into());
        self
    }

    /// Set the HMAC key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the trusted subnet.
    #[must_use]
    pub const fn with_trusted_subnet(mut self, subnet: IpNet) -> Self {
        self.trusted_subnet = Some(subnet);
        self
    }

    /// Set the RSA private key path.
    #[must_use]
    pub fn with_crypto_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.crypto_key = Some(path.into());
        self
    }

    /// Set the audit file.
    #[must_use]
    pub fn with_audit_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_file = Some(path.into());
        self
    }

    /// Set the audit endpoint.
    #[must_use]
    pub fn with_audit_url(mut self, url: impl Into<String>) -> Self {
        self.audit_url = Some(url.into());
        self
    }

    /// Returns `true` if snapshots are taken after every ingest.
    #[must_use]
    pub const fn is_synchronous(&self) -> bool {
        self.store_interval.is_zero()
    }

    /// Resolve the configuration from defaults, the JSON file named by
    /// `args.config` (if any) and the remaining flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any value is invalid.
    pub fn load(args: &ServerArgs) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = &args.config {
            config.apply_file(&ServerFileConfig::from_file(path)?)?;
        }
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: &ServerFileConfig) -> Result<()> {
        if let Some(address) = file.address.as_ref().filter(|a| !a.is_empty()) {
            self.address.clone_from(address);
        }
        if let Some(interval) = file.store_interval.as_ref().filter(|i| !i.is_empty()) {
            self.store_interval = parse_duration(interval)
                .map_err(|e| ServerError::Config(format!("invalid store_interval: {e}")))?;
        }
        if let Some(path) = file.store_file.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            self.file_storage_path = Some(path.clone());
        }
        if let Some(restore) = file.restore {
            self.restore = restore;
        }
        if let Some(dsn) = file.database_dsn.as_ref().filter(|d| !d.is_empty()) {
            self.database_dsn = Some(dsn.clone());
        }
        if let Some(path) = file.crypto_key.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            self.crypto_key = Some(path.clone());
        }
        if let Some(subnet) = file.trusted_subnet.as_ref().filter(|s| !s.is_empty()) {
            self.trusted_subnet = Some(parse_subnet(subnet)?);
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &ServerArgs) {
        if let Some(address) = &args.address {
            self.address.clone_from(address);
        }
        if let Some(interval) = args.store_interval {
            self.store_interval = interval;
        }
        if let Some(path) = &args.file_storage_path {
            // An explicit empty path disables file persistence.
            self.file_storage_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(restore) = args.restore {
            self.restore = restore;
        }
        if let Some(dsn) = &args.database_dsn {
            self.database_dsn = (!dsn.is_empty()).then(|| dsn.clone());
        }
        if let Some(key) = args.key.as_ref().filter(|k| !k.is_empty()) {
            self.key = Some(key.clone());
        }
        if let Some(path) = &args.audit_file {
            self.audit_file = Some(path.clone());
        }
        if let Some(url) = args.audit_url.as_ref().filter(|u| !u.is_empty()) {
            self.audit_url = Some(url.clone());
        }
        if let Some(path) = &args.crypto_key {
            self.crypto_key = Some(path.clone());
        }
        if let Some(subnet) = args.trusted_subnet {
            self.trusted_subnet = Some(subnet);
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(ServerError::Config("address cannot be empty".to_string()));
        }

        if let Some(url) = &self.audit_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ServerError::Config(format!(
                    "audit_url must be an http(s) URL, got {url}"
                )));
            }
        }

        Ok(())
    }
}

fn parse_subnet(raw: &str) -> Result<IpNet> {
    raw.parse()
        .map_err(|e| ServerError::Config(format!("invalid trusted_subnet {raw}: {e}")))
}

/// Shape of the optional JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerFileConfig {
    /// Listen address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Snapshot interval, e.g. `"300s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_interval: Option<String>,
    /// Snapshot file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_file: Option<PathBuf>,
    /// Restore on startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<bool>,
    /// PostgreSQL connection string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_dsn: Option<String>,
    /// RSA private key path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,
    /// Trusted subnet in CIDR notation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_subnet: Option<String>,
}

impl ServerFileConfig {
    /// Read a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parse config JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| ServerError::Config(format!("cannot parse config json: {e}")))
    }

    /// A sample file with every default spelled out.
    #[must_use]
    pub fn sample() -> Self {
        let defaults = ServerConfig::default();
        Self {
            address: Some(defaults.address),
            store_interval: Some(format!("{}s", defaults.store_interval.as_secs())),
            store_file: defaults.file_storage_path,
            restore: Some(defaults.restore),
            database_dsn: None,
            crypto_key: None,
            trusted_subnet: None,
        }
    }
}

/// Command-line and environment overrides.
#[derive(Debug, Clone, Default, Args)]
pub struct ServerArgs {
    /// Path to a JSON config file
    #[arg(short = 'c', long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Snapshot interval; 0 snapshots after every ingest
    #[arg(short = 'i', long, env = "STORE_INTERVAL", value_parser = parse_duration)]
    pub store_interval: Option<Duration>,

    /// Snapshot file; empty disables file persistence
    #[arg(short = 'f', long, env = "FILE_STORAGE_PATH")]
    pub file_storage_path: Option<String>,

    /// Restore the store from the snapshot on startup
    #[arg(short = 'r', long, env = "RESTORE", value_parser = BoolishValueParser::new())]
    pub restore: Option<bool>,

    /// PostgreSQL connection string
    #[arg(short = 'd', long, env = "DATABASE_DSN", hide_env_values = true)]
    pub database_dsn: Option<String>,

    /// HMAC-SHA256 key
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Audit log file (JSON lines)
    #[arg(long, env = "AUDIT_FILE")]
    pub audit_file: Option<PathBuf>,

    /// Audit endpoint URL
    #[arg(long, env = "AUDIT_URL")]
    pub audit_url: Option<String>,

    /// Path to the RSA private key (PEM)
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Trusted agent subnet in CIDR notation
    #[arg(short = 't', long, env = "TRUSTED_SUBNET")]
    pub trusted_subnet: Option<IpNet>,
}
