//! Audit trail of successful ingests.
//!
//! Every accepted update publishes one [`AuditEvent`] to the configured
//! [`AuditObserver`]s. Observer failures are logged and never reach the
//! client.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

/// Timeout applied to each audit POST.
pub const HTTP_AUDIT_TIMEOUT: Duration = Duration::from_secs(3);

/// One successful ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unix timestamp in seconds.
    pub ts: i64,
    /// Names of the metrics touched.
    pub metrics: Vec<String>,
    /// Caller address.
    pub ip_address: String,
}

impl AuditEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(metrics: Vec<String>, ip_address: impl Into<String>) -> Self {
        Self {
            ts: Utc::now().timestamp(),
            metrics,
            ip_address: ip_address.into(),
        }
    }
}

/// Trait for audit destinations.
pub trait AuditObserver: Send + Sync {
    /// Records an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be handed to the destination.
    fn notify(&self, event: &AuditEvent) -> Result<()>;

    /// Returns the name of this observer for logging purposes.
    fn name(&self) -> &'static str;
}

/// Appends events to a file, one JSON object per line.
///
/// Inside a runtime the write runs on the blocking pool and `notify`
/// returns before it lands; outside one it is written inline.
#[derive(Debug)]
pub struct FileAuditObserver {
    file: Arc<Mutex<File>>,
}

impl FileAuditObserver {
    /// Opens `path` for appending, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

impl AuditObserver for FileAuditObserver {
    fn notify(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| ServerError::Internal(format!("cannot encode audit event: {e}")))?;
        line.push(b'\n');

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.file.lock().write_all(&line)?;
            return Ok(());
        };
        let file = Arc::clone(&self.file);
        runtime.spawn_blocking(move || {
            if let Err(e) = file.lock().write_all(&line) {
                warn!(error = %e, "audit file write failed");
            }
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// POSTs each event as JSON to a remote endpoint.
///
/// Delivery runs on a spawned task; `notify` does not wait for it.
#[derive(Debug, Clone)]
pub struct HttpAuditObserver {
    client: reqwest::Client,
    url: String,
}

impl HttpAuditObserver {
    /// Creates an observer posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_AUDIT_TIMEOUT)
            .build()
            .map_err(|e| ServerError::Internal(format!("cannot build audit client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AuditObserver for HttpAuditObserver {
    fn notify(&self, event: &AuditEvent) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ServerError::Internal(format!("no runtime for audit delivery: {e}")))?;
        let request = self.client.post(&self.url).json(event);
        let url = self.url.clone();
        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(url = %url, status = %response.status(), "audit endpoint rejected event");
                }
                Ok(_) => debug!(url = %url, "audit event delivered"),
                Err(e) => warn!(url = %url, error = %e, "audit delivery failed"),
            }
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Emits events through `tracing` under the `tally_audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditObserver;

impl AuditObserver for TracingAuditObserver {
    fn notify(&self, event: &AuditEvent) -> Result<()> {
        tracing::info!(
            target: "tally_audit",
            ts = event.ts,
            metrics = ?event.metrics,
            ip_address = %event.ip_address,
            "metrics ingested"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Fans events out to every subscribed observer.
#[derive(Clone, Default)]
pub struct AuditPublisher {
    observers: Vec<Arc<dyn AuditObserver>>,
}

impl AuditPublisher {
    /// Creates a publisher with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the observers named by the configuration. The tracing
    /// observer is always present.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit file cannot be opened.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let mut publisher = Self::new().with_observer(TracingAuditObserver);
        if let Some(path) = &config.audit_file {
            publisher.subscribe(Arc::new(FileAuditObserver::open(path)?));
        }
        if let Some(url) = &config.audit_url {
            publisher.subscribe(Arc::new(HttpAuditObserver::new(url)?));
        }
        Ok(publisher)
    }

    /// Adds an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: impl AuditObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Adds a shared observer.
    pub fn subscribe(&mut self, observer: Arc<dyn AuditObserver>) {
        self.observers.push(observer);
    }

    /// Returns the number of observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Returns `true` if nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Hands `event` to every observer.
    pub fn publish(&self, event: &AuditEvent) {
        for observer in &self.observers {
            if let Err(e) = observer.notify(event) {
                warn!(observer = observer.name(), error = %e, "audit observer failed");
            }
        }
    }
}

impl std::fmt::Debug for AuditPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("AuditPublisher")
            .field("observers", &names)
            .finish()
    }
}
