//! Durable snapshots of the server's store.
//!
//! A [`SnapshotSink`] knows how to write and read one snapshot. The
//! [`PersistenceSync`] decides when: on a fixed interval, or after every
//! successful ingest when the interval is zero.

mod file;
mod pg;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tally_core::{Metric, MetricStore, MetricUpdate, Snapshot};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use file::FileSink;
pub use pg::PgSink;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

/// Boxed future returned by [`SnapshotSink`] methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Trait for snapshot destinations.
pub trait SnapshotSink: Send + Sync {
    /// Persists `snapshot`, replacing whatever the sink held for each metric.
    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> SinkFuture<'a, ()>;

    /// Reads back every persisted record.
    fn load(&self) -> SinkFuture<'_, Vec<Metric>>;

    /// Checks that the backend is reachable.
    fn ping(&self) -> SinkFuture<'_, ()> {
        let name = self.name();
        Box::pin(async move {
            Err(ServerError::Unavailable(format!(
                "{name} sink has no health check"
            )))
        })
    }

    /// Returns the name of this sink for logging purposes.
    fn name(&self) -> &'static str;
}

/// When snapshots are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Every period, regardless of activity.
    Interval(Duration),
    /// After every successful ingest.
    Synchronous,
}

impl SyncMode {
    /// Zero selects [`SyncMode::Synchronous`].
    #[must_use]
    pub const fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            Self::Synchronous
        } else {
            Self::Interval(interval)
        }
    }
}

/// Keeps a sink in step with the store.
#[derive(Clone)]
pub struct PersistenceSync {
    store: MetricStore,
    sink: Option<Arc<dyn SnapshotSink>>,
    mode: SyncMode,
    write_lock: Arc<Mutex<()>>,
}

impl PersistenceSync {
    /// Creates a sync writing `store` to `sink`.
    #[must_use]
    pub fn new(store: MetricStore, sink: Arc<dyn SnapshotSink>, mode: SyncMode) -> Self {
        Self {
            store,
            sink: Some(sink),
            mode,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Creates a sync that persists nothing.
    #[must_use]
    pub fn disabled(store: MetricStore) -> Self {
        Self {
            store,
            sink: None,
            mode: SyncMode::Synchronous,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Selects the sink from the configuration: a database DSN wins over a
    /// file path; with neither, persistence is off.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached or migrated.
    pub async fn from_config(config: &ServerConfig, store: MetricStore) -> Result<Self> {
        let mode = SyncMode::from_interval(config.store_interval);
        if let Some(dsn) = &config.database_dsn {
            let sink = PgSink::connect(dsn).await?;
            return Ok(Self::new(store, Arc::new(sink), mode));
        }
        if let Some(path) = &config.file_storage_path {
            return Ok(Self::new(store, Arc::new(FileSink::new(path)), mode));
        }
        info!("no snapshot destination configured, persistence disabled");
        Ok(Self::disabled(store))
    }

    /// Returns the snapshot schedule.
    #[must_use]
    pub const fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Returns `true` if a sink is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Returns the sink name, if any.
    #[must_use]
    pub fn sink_name(&self) -> Option<&'static str> {
        self.sink.as_ref().map(|s| s.name())
    }

    /// Rehydrates the store from the sink: counters are added, gauges set.
    ///
    /// Returns the number of records applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be read or holds an invalid record.
    pub async fn restore(&self) -> Result<usize> {
        let Some(sink) = &self.sink else {
            return Ok(0);
        };
        let records = sink.load().await?;
        let updates = records
            .iter()
            .map(Metric::to_update)
            .collect::<std::result::Result<Vec<MetricUpdate>, _>>()
            .map_err(|e| ServerError::Persistence(format!("invalid persisted record: {e}")))?;
        self.store
            .apply_batch(&updates)
            .map_err(|e| ServerError::Persistence(format!("cannot apply persisted records: {e}")))?;
        info!(sink = sink.name(), metrics = updates.len(), "store restored");
        Ok(updates.len())
    }

    /// Writes the current store to the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the write.
    pub async fn snapshot(&self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let snapshot = self.store.snapshot();
        sink.save(&snapshot).await?;
        debug!(sink = sink.name(), metrics = snapshot.len(), "snapshot written");
        Ok(())
    }

    /// Called after a successful ingest. Writes a snapshot in synchronous
    /// mode; a failure is logged and the in-memory update stands.
    pub async fn after_ingest(&self) {
        if self.mode != SyncMode::Synchronous {
            return;
        }
        if let Err(e) = self.snapshot().await {
            error!(error = %e, "synchronous snapshot failed");
        }
    }

    /// Checks the sink's backend.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Unavailable`] if no sink is configured or the
    /// backend does not answer.
    pub async fn ping(&self) -> Result<()> {
        match &self.sink {
            Some(sink) => sink.ping().await,
            None => Err(ServerError::Unavailable(
                "database is not configured".to_string(),
            )),
        }
    }

    /// Starts the periodic snapshot task in interval mode.
    ///
    /// The task writes one last snapshot after `shutdown` fires. Returns
    /// `None` in synchronous mode or when persistence is off.
    #[must_use]
    pub fn spawn_interval(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let SyncMode::Interval(period) = self.mode else {
            return None;
        };
        if self.sink.is_none() {
            return None;
        }

        let sync = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?period, "periodic snapshots started");

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sync.snapshot().await {
                            error!(error = %e, "periodic snapshot failed");
                        }
                    }
                }
            }

            match sync.snapshot().await {
                Ok(()) => info!("final snapshot written"),
                Err(e) => error!(error = %e, "final snapshot failed"),
            }
        }))
    }
}

impl std::fmt::Debug for PersistenceSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceSync")
            .field("sink", &self.sink_name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Debug, Default)]
    struct MemorySink {
        saved: SyncMutex<Vec<Snapshot>>,
        stored: SyncMutex<Vec<Metric>>,
        fail: bool,
    }

    impl SnapshotSink for MemorySink {
        fn save<'a>(&'a self, snapshot: &'a Snapshot) -> SinkFuture<'a, ()> {
            Box::pin(async move {
                if self.fail {
                    return Err(ServerError::Persistence("disk full".to_string()));
                }
                self.saved.lock().push(snapshot.clone());
                Ok(())
            })
        }

        fn load(&self) -> SinkFuture<'_, Vec<Metric>> {
            Box::pin(async move { Ok(self.stored.lock().clone()) })
        }

        fn name(&self) -> &'static str {
            "memory"
        }
    }

    fn sync_with(sink: &Arc<MemorySink>, mode: SyncMode) -> (MetricStore, PersistenceSync) {
        let store = MetricStore::new();
        let sync = PersistenceSync::new(
            store.clone(),
            Arc::clone(sink) as Arc<dyn SnapshotSink>,
            mode,
        );
        (store, sync)
    }

    #[test]
    fn test_mode_from_interval() {
        assert_eq!(SyncMode::from_interval(Duration::ZERO), SyncMode::Synchronous);
        assert_eq!(
            SyncMode::from_interval(Duration::from_secs(300)),
            SyncMode::Interval(Duration::from_secs(300))
        );
    }

    mod restore {
        use super::*;

        #[tokio::test]
        async fn test_counters_added_gauges_set() {
            let sink = Arc::new(MemorySink::default());
            *sink.stored.lock() = vec![Metric::counter("reqs", 5), Metric::gauge("temp", 36.6)];
            let (store, sync) = sync_with(&sink, SyncMode::Synchronous);
            store.add_counter("reqs", 3).unwrap();
            store.set_gauge("temp", 1.0).unwrap();

            assert_eq!(sync.restore().await.unwrap(), 2);

            assert_eq!(store.get_counter("reqs").unwrap(), 8);
            assert!((store.get_gauge("temp").unwrap() - 36.6).abs() < f64::EPSILON);
        }

        #[tokio::test]
        async fn test_counter_without_delta_fails() {
            let sink = Arc::new(MemorySink::default());
            *sink.stored.lock() = vec![Metric {
                id: "reqs".to_string(),
                kind: "counter".to_string(),
                delta: None,
                value: Some(1.0),
            }];
            let (store, sync) = sync_with(&sink, SyncMode::Synchronous);

            assert!(matches!(sync.restore().await, Err(ServerError::Persistence(_))));
            assert!(store.is_empty());
        }

        #[tokio::test]
        async fn test_unknown_type_fails() {
            let sink = Arc::new(MemorySink::default());
            *sink.stored.lock() = vec![Metric {
                id: "h".to_string(),
                kind: "histogram".to_string(),
                delta: None,
                value: None,
            }];
            let (_, sync) = sync_with(&sink, SyncMode::Synchronous);
            assert!(sync.restore().await.is_err());
        }

        #[tokio::test]
        async fn test_disabled_restores_nothing() {
            let sync = PersistenceSync::disabled(MetricStore::new());
            assert_eq!(sync.restore().await.unwrap(), 0);
            assert!(!sync.is_enabled());
        }
    }

    mod modes {
        use super::*;

        #[tokio::test]
        async fn test_synchronous_snapshots_after_ingest() {
            let sink = Arc::new(MemorySink::default());
            let (store, sync) = sync_with(&sink, SyncMode::Synchronous);
            store.add_counter("reqs", 1).unwrap();

            sync.after_ingest().await;

            let saved = sink.saved.lock().clone();
            assert_eq!(saved.len(), 1);
            assert_eq!(saved[0].counters, vec![("reqs".to_string(), 1)]);
        }

        #[tokio::test]
        async fn test_interval_mode_ignores_ingest() {
            let sink = Arc::new(MemorySink::default());
            let (_, sync) = sync_with(&sink, SyncMode::Interval(Duration::from_secs(60)));

            sync.after_ingest().await;

            assert!(sink.saved.lock().is_empty());
        }

        #[tokio::test]
        async fn test_failed_sync_write_keeps_store() {
            let sink = Arc::new(MemorySink {
                fail: true,
                ..MemorySink::default()
            });
            let (store, sync) = sync_with(&sink, SyncMode::Synchronous);
            store.set_gauge("temp", 1.5).unwrap();

            sync.after_ingest().await;

            assert!((store.get_gauge("temp").unwrap() - 1.5).abs() < f64::EPSILON);
        }

        #[tokio::test(start_paused = true)]
        async fn test_interval_task_snapshots_and_flushes_on_shutdown() {
            let sink = Arc::new(MemorySink::default());
            let (store, sync) = sync_with(&sink, SyncMode::Interval(Duration::from_secs(10)));
            store.add_counter("reqs", 1).unwrap();

            let token = CancellationToken::new();
            let task = sync.spawn_interval(token.clone()).unwrap();

            tokio::time::sleep(Duration::from_secs(25)).await;
            assert_eq!(sink.saved.lock().len(), 2);

            store.add_counter("reqs", 1).unwrap();
            token.cancel();
            task.await.unwrap();

            let saved = sink.saved.lock().clone();
            assert_eq!(saved.len(), 3);
            assert_eq!(saved[2].counters, vec![("reqs".to_string(), 2)]);
        }

        #[tokio::test]
        async fn test_no_interval_task_in_synchronous_mode() {
            let sink = Arc::new(MemorySink::default());
            let (_, sync) = sync_with(&sink, SyncMode::Synchronous);
            assert!(sync.spawn_interval(CancellationToken::new()).is_none());
        }
    }

    mod ping {
        use super::*;

        #[tokio::test]
        async fn test_disabled_is_unavailable() {
            let sync = PersistenceSync::disabled(MetricStore::new());
            assert!(matches!(sync.ping().await, Err(ServerError::Unavailable(_))));
        }

        #[tokio::test]
        async fn test_sink_without_health_check_is_unavailable() {
            let sink = Arc::new(MemorySink::default());
            let (_, sync) = sync_with(&sink, SyncMode::Synchronous);
            assert!(matches!(sync.ping().await, Err(ServerError::Unavailable(_))));
        }
    }

    #[tokio::test]
    async fn test_from_config_selects_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new("127.0.0.1:0")
            .with_file_storage_path(dir.path().join("m.json"))
            .with_store_interval(Duration::ZERO);

        let sync = PersistenceSync::from_config(&config, MetricStore::new())
            .await
            .unwrap();

        assert_eq!(sync.sink_name(), Some("file"));
        assert_eq!(sync.mode(), SyncMode::Synchronous);
    }

    #[tokio::test]
    async fn test_from_config_without_destination() {
        let sync = PersistenceSync::from_config(&ServerConfig::new("127.0.0.1:0"), MetricStore::new())
            .await
            .unwrap();
        assert!(!sync.is_enabled());
    }
}
