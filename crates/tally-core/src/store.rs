//! Concurrent in-memory metric store.
//!
//! This module provides the [`MetricStore`], a map from metric name to a
//! gauge or counter value. One name holds exactly one kind; writing the other
//! kind under a taken name is rejected with [`CoreError::KindConflict`].
//! Entries are created on first write and never removed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{Metric, MetricKind, MetricUpdate, MetricValue};

/// Thread-safe store of gauges and counters.
///
/// Cloning is cheap and yields a handle to the same underlying map, so one
/// instance can be shared between the collector, ingest handlers and the
/// persistence task.
#[derive(Debug, Default)]
pub struct MetricStore {
    entries: Arc<RwLock<HashMap<String, MetricValue>>>,
}

impl MetricStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a gauge, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KindConflict` if `name` already holds a counter.
    pub fn set_gauge(&self, name: &str, value: f64) -> Result<()> {
        let mut entries = self.entries.write();
        check_kind(&entries, name, MetricKind::Gauge)?;
        entries.insert(name.to_string(), MetricValue::Gauge(value));
        Ok(())
    }

    /// Adds `delta` to a counter, creating it at zero first if absent.
    ///
    /// Returns the new total.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KindConflict` if `name` already holds a gauge.
    pub fn add_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.write();
        check_kind(&entries, name, MetricKind::Counter)?;
        Ok(add_in_place(&mut entries, name, delta))
    }

    /// Returns the current value of a gauge.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MetricNotFound` if no gauge is stored under `name`.
    pub fn get_gauge(&self, name: &str) -> Result<f64> {
        match self.get(MetricKind::Gauge, name)? {
            MetricValue::Gauge(v) => Ok(v),
            MetricValue::Counter(_) => Err(not_found(MetricKind::Gauge, name)),
        }
    }

    /// Returns the current total of a counter.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MetricNotFound` if no counter is stored under `name`.
    pub fn get_counter(&self, name: &str) -> Result<i64> {
        match self.get(MetricKind::Counter, name)? {
            MetricValue::Counter(v) => Ok(v),
            MetricValue::Gauge(_) => Err(not_found(MetricKind::Counter, name)),
        }
    }

    /// Returns the value stored under `name` if it has the requested kind.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MetricNotFound` if the name is absent or holds the other kind.
    pub fn get(&self, kind: MetricKind, name: &str) -> Result<MetricValue> {
        self.entries
            .read()
            .get(name)
            .copied()
            .filter(|v| v.kind() == kind)
            .ok_or_else(|| not_found(kind, name))
    }

    /// Returns all gauges sorted by name.
    #[must_use]
    pub fn all_gauges(&self) -> Vec<(String, f64)> {
        self.snapshot().gauges
    }

    /// Returns all counters sorted by name.
    #[must_use]
    pub fn all_counters(&self) -> Vec<(String, i64)> {
        self.snapshot().counters
    }

    /// Takes a consistent copy of the whole store.
    ///
    /// Counters and gauges are read under the same lock, so the snapshot
    /// never mixes states from before and after a concurrent batch.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let entries = self.entries.read();
        let mut snapshot = Snapshot::default();
        for (name, value) in entries.iter() {
            match *value {
                MetricValue::Gauge(v) => snapshot.gauges.push((name.clone(), v)),
                MetricValue::Counter(v) => snapshot.counters.push((name.clone(), v)),
            }
        }
        drop(entries);
        snapshot.counters.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot.gauges.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Applies a single update.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KindConflict` if the name holds the other kind.
    pub fn apply(&self, update: &MetricUpdate) -> Result<()> {
        match update {
            MetricUpdate::Gauge { name, value } => self.set_gauge(name, *value),
            MetricUpdate::Counter { name, delta } => self.add_counter(name, *delta).map(|_| ()),
        }
    }

    /// Applies a batch of updates atomically.
    ///
    /// The whole batch is checked for kind conflicts, both against the store
    /// and within itself, before anything is written. On error the store is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KindConflict` on the first conflicting name.
    #[allow(clippy::significant_drop_tightening)] // Lock spans validation and write
    pub fn apply_batch(&self, updates: &[MetricUpdate]) -> Result<()> {
        let mut entries = self.entries.write();

        let mut seen: HashMap<&str, MetricKind> = HashMap::with_capacity(updates.len());
        for update in updates {
            check_kind(&entries, update.name(), update.kind())?;
            match seen.insert(update.name(), update.kind()) {
                Some(earlier) if earlier != update.kind() => {
                    return Err(CoreError::KindConflict {
                        name: update.name().to_string(),
                        existing: earlier,
                    });
                }
                _ => {}
            }
        }

        for update in updates {
            match update {
                MetricUpdate::Gauge { name, value } => {
                    entries.insert(name.clone(), MetricValue::Gauge(*value));
                }
                MetricUpdate::Counter { name, delta } => {
                    add_in_place(&mut entries, name, *delta);
                }
            }
        }

        debug!(updates = updates.len(), total = entries.len(), "applied metric batch");
        Ok(())
    }

    /// Returns the number of stored metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing has been stored yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Clone for MetricStore {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

fn check_kind(entries: &HashMap<String, MetricValue>, name: &str, kind: MetricKind) -> Result<()> {
    match entries.get(name) {
        Some(existing) if existing.kind() != kind => Err(CoreError::KindConflict {
            name: name.to_string(),
            existing: existing.kind(),
        }),
        _ => Ok(()),
    }
}

fn add_in_place(entries: &mut HashMap<String, MetricValue>, name: &str, delta: i64) -> i64 {
    let slot = entries
        .entry(name.to_string())
        .or_insert(MetricValue::Counter(0));
    let total = match *slot {
        MetricValue::Counter(current) => current.saturating_add(delta),
        MetricValue::Gauge(_) => delta,
    };
    *slot = MetricValue::Counter(total);
    total
}

fn not_found(kind: MetricKind, name: &str) -> CoreError {
    CoreError::MetricNotFound {
        kind,
        name: name.to_string(),
    }
}

/// A point-in-time copy of the store, counters and gauges sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Counter totals.
    pub counters: Vec<(String, i64)>,
    /// Gauge values.
    pub gauges: Vec<(String, f64)>,
}

impl Snapshot {
    /// Returns the number of metrics in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len()
    }

    /// Returns true if the snapshot holds no metrics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }

    /// Converts the snapshot into wire records, counters first.
    #[must_use]
    pub fn to_metrics(&self) -> Vec<Metric> {
        self.counters
            .iter()
            .map(|(name, total)| Metric::counter(name.clone(), *total))
            .chain(
                self.gauges
                    .iter()
                    .map(|(name, value)| Metric::gauge(name.clone(), *value)),
            )
            .collect()
    }
}
