//! Shared request state.

use tally_core::{MetricStore, MetricUpdate};

use crate::audit::{AuditEvent, AuditPublisher};
use crate::persist::PersistenceSync;
use crate::trust::TrustPolicy;

/// State shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Live metrics.
    pub store: MetricStore,
    /// Snapshot writer.
    pub persistence: PersistenceSync,
    /// Audit fan-out.
    pub audit: AuditPublisher,
    /// Subnet, hash and decryption settings.
    pub trust: TrustPolicy,
}

impl AppState {
    /// Creates state from its parts.
    #[must_use]
    pub fn new(
        store: MetricStore,
        persistence: PersistenceSync,
        audit: AuditPublisher,
        trust: TrustPolicy,
    ) -> Self {
        Self {
            store,
            persistence,
            audit,
            trust,
        }
    }

    /// Creates state around `store` with no persistence, no audit observers
    /// and no trust checks.
    #[must_use]
    pub fn for_store(store: MetricStore) -> Self {
        let persistence = PersistenceSync::disabled(store.clone());
        Self::new(store, persistence, AuditPublisher::new(), TrustPolicy::new())
    }

    /// Publishes an audit event naming every metric in `updates`.
    ///
    /// Nothing is published for an empty batch.
    pub fn audit_ingest(&self, updates: &[MetricUpdate], ip_address: &str) {
        if updates.is_empty() {
            return;
        }
        let names = updates.iter().map(|u| u.name().to_string()).collect();
        self.audit.publish(&AuditEvent::new(names, ip_address));
    }
}
