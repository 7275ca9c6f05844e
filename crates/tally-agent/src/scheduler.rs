//! The agent's control loop.
//!
//! One task drives collection and report ticks. Both tick kinds take a
//! pacing token first. Report ticks then need a free delivery slot; when
//! every slot is busy the tick is dropped, never queued. Deliveries run on
//! their own tasks so the loop never touches the network.
//!
//! Shutdown moves the scheduler from `Running` to `ShuttingDown`, waits for
//! in-flight deliveries, performs a single final flush of the current
//! snapshot, and ends in `Stopped`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tally_core::{Metric, MetricStore};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::admission::Admission;
use crate::collector::Collector;
use crate::config::AgentConfig;
use crate::pacer::Pacer;
use crate::transport::Transport;

/// Lifecycle state of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SchedulerState {
    /// Ticks are being processed.
    Running = 0,
    /// No new ticks; in-flight deliveries are draining.
    ShuttingDown = 1,
    /// Final flush done.
    Stopped = 2,
}

impl SchedulerState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Timing and concurrency settings for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Collection tick period.
    pub poll_interval: Duration,
    /// Report tick period.
    pub report_interval: Duration,
    /// Pacing tokens per second shared by both tick kinds.
    pub rate_limit: u32,
    /// Maximum concurrent deliveries.
    pub max_in_flight: usize,
}

impl From<&AgentConfig> for SchedulerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            report_interval: config.report_interval,
            rate_limit: config.rate_limit,
            max_in_flight: config.max_in_flight,
        }
    }
}

/// Counters maintained while the scheduler runs.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    collections: AtomicU64,
    deliveries_started: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
    ticks_dropped: AtomicU64,
    final_flushes: AtomicU64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, peak_in_flight: usize) -> StatsSnapshot {
        StatsSnapshot {
            collections: self.collections.load(Ordering::Relaxed),
            deliveries_started: self.deliveries_started.load(Ordering::Relaxed),
            deliveries_succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            final_flushes: self.final_flushes.load(Ordering::Relaxed),
            peak_in_flight,
        }
    }
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Collection passes run.
    pub collections: u64,
    /// Deliveries started, including the final flush.
    pub deliveries_started: u64,
    /// Deliveries the server accepted.
    pub deliveries_succeeded: u64,
    /// Deliveries that failed and were abandoned.
    pub deliveries_failed: u64,
    /// Report ticks dropped because every slot was busy.
    pub ticks_dropped: u64,
    /// Final flushes performed.
    pub final_flushes: u64,
    /// Highest number of concurrent deliveries observed.
    pub peak_in_flight: usize,
}

/// Cloneable control handle for a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    token: CancellationToken,
    state: Arc<AtomicU8>,
    stats: Arc<SchedulerStats>,
    admission: Admission,
}

impl SchedulerHandle {
    /// Requests shutdown.
    ///
    /// Returns `true` for the call that moved the scheduler out of
    /// `Running`; every later call is a no-op returning `false`.
    pub fn shutdown(&self) -> bool {
        let first = self
            .state
            .compare_exchange(
                SchedulerState::Running as u8,
                SchedulerState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if first {
            info!("shutdown requested");
            self.token.cancel();
        } else {
            debug!(state = ?self.state(), "shutdown already in progress");
        }
        first
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns the current counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.admission.peak())
    }

    /// Returns the number of deliveries currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }
}

/// Collection and delivery scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    store: MetricStore,
    collector: Collector,
    transport: Arc<dyn Transport>,
    admission: Admission,
    pacer: Pacer,
    tracker: TaskTracker,
    token: CancellationToken,
    state: Arc<AtomicU8>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    /// Creates a scheduler. The pacer starts minting tokens immediately.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        store: MetricStore,
        collector: Collector,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            admission: Admission::new(config.max_in_flight),
            pacer: Pacer::per_second(config.rate_limit),
            config,
            store,
            collector,
            transport,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(SchedulerState::Running as u8)),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Returns a handle for shutdown and inspection.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            token: self.token.clone(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            admission: self.admission.clone(),
        }
    }

    /// Runs until shutdown is requested through a [`SchedulerHandle`], then
    /// drains and flushes.
    pub async fn run(mut self) -> StatsSnapshot {
        let token = self.token.clone();
        let mut poll = ticker(self.config.poll_interval);
        let mut report = ticker(self.config.report_interval);

        info!(
            poll_interval = ?self.config.poll_interval,
            report_interval = ?self.config.report_interval,
            rate_limit = self.config.rate_limit,
            max_in_flight = self.admission.capacity(),
            transport = self.transport.name(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = poll.tick() => self.on_collection_tick(&token).await,
                _ = report.tick() => self.on_report_tick(&token).await,
            }
        }

        self.finish().await
    }

    async fn on_collection_tick(&mut self, token: &CancellationToken) {
        if !self.pacer.acquire(token).await {
            return;
        }
        self.collector.collect(&self.store);
        SchedulerStats::bump(&self.stats.collections);
    }

    async fn on_report_tick(&mut self, token: &CancellationToken) {
        if !self.pacer.acquire(token).await {
            return;
        }
        // Shutdown may have landed while the token was pending.
        if token.is_cancelled() || self.state() != SchedulerState::Running {
            debug!("shutdown pending, skipping report tick");
            return;
        }

        let Some(slot) = self.admission.try_admit() else {
            warn!(
                max_in_flight = self.admission.capacity(),
                "all delivery slots busy, dropping report tick"
            );
            SchedulerStats::bump(&self.stats.ticks_dropped);
            return;
        };

        let batch = self.store.snapshot().to_metrics();
        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);
        SchedulerStats::bump(&stats.deliveries_started);

        self.tracker.spawn(async move {
            let _slot = slot;
            deliver(transport.as_ref(), &stats, &batch).await;
        });
    }

    fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn finish(self) -> StatsSnapshot {
        self.state
            .store(SchedulerState::ShuttingDown as u8, Ordering::SeqCst);
        info!(in_flight = self.admission.in_flight(), "draining deliveries");

        self.tracker.close();
        self.tracker.wait().await;

        let batch = self.store.snapshot().to_metrics();
        info!(metrics = batch.len(), "final flush");
        SchedulerStats::bump(&self.stats.deliveries_started);
        SchedulerStats::bump(&self.stats.final_flushes);
        deliver(self.transport.as_ref(), &self.stats, &batch).await;

        self.state.store(SchedulerState::Stopped as u8, Ordering::SeqCst);
        let stats = self.stats.snapshot(self.admission.peak());
        info!(?stats, "scheduler stopped");
        stats
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("collector", &self.collector)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn deliver(transport: &dyn Transport, stats: &SchedulerStats, batch: &[Metric]) {
    match transport.deliver(batch).await {
        Ok(()) => {
            SchedulerStats::bump(&stats.deliveries_succeeded);
            debug!(transport = transport.name(), metrics = batch.len(), "delivery finished");
        }
        Err(e) => {
            SchedulerStats::bump(&stats.deliveries_failed);
            warn!(transport = transport.name(), error = %e, "delivery failed, cycle abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use tally_core::MetricUpdate;

    use crate::collector::MetricSource;
    use crate::error::{AgentError, Result};
    use crate::transport::DeliveryFuture;

    #[derive(Debug, Default)]
    struct MockTransport {
        delay: Duration,
        fail: bool,
        starts: Mutex<Vec<Instant>>,
        batches: Mutex<Vec<Vec<Metric>>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl MockTransport {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }

        fn starts(&self) -> Vec<Instant> {
            self.starts.lock().clone()
        }
    }

    impl Transport for MockTransport {
        fn deliver<'a>(&'a self, batch: &'a [Metric]) -> DeliveryFuture<'a> {
            Box::pin(async move {
                self.starts.lock().push(Instant::now());
                self.batches.lock().push(batch.to_vec());
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.active.fetch_sub(1, Ordering::SeqCst);
                if self.fail {
                    Err(AgentError::Transport("connection refused".to_string()))
                } else {
                    Ok(())
                }
            })
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    struct TickSource;

    impl MetricSource for TickSource {
        fn collect(&mut self) -> Result<Vec<MetricUpdate>> {
            Ok(vec![MetricUpdate::Counter {
                name: "PollCount".to_string(),
                delta: 1,
            }])
        }

        fn name(&self) -> &'static str {
            "tick"
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn config(report_ms: u64, rate_limit: u32, max_in_flight: usize) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: HOUR,
            report_interval: Duration::from_millis(report_ms),
            rate_limit,
            max_in_flight,
        }
    }

    fn scheduler(config: SchedulerConfig, transport: &Arc<MockTransport>) -> Scheduler {
        let store = MetricStore::new();
        store.add_counter("reqs", 1).unwrap();
        Scheduler::new(config, store, Collector::new(), Arc::clone(transport) as Arc<dyn Transport>)
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn test_config_from_agent_config() {
        let agent = AgentConfig::default()
            .with_rate_limit(5)
            .with_max_in_flight(3);
        let config = SchedulerConfig::from(&agent);
        assert_eq!(config.rate_limit, 5);
        assert_eq!(config.max_in_flight, 3);
        assert_eq!(config.report_interval, agent.report_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_tick_after_shutdown_starts_nothing() {
        let transport = MockTransport::with_delay(Duration::ZERO);
        let mut scheduler = scheduler(config(50, 100, 4), &transport);
        // State has flipped but the token is not cancelled yet.
        scheduler
            .state
            .store(SchedulerState::ShuttingDown as u8, Ordering::SeqCst);

        scheduler.on_report_tick(&CancellationToken::new()).await;

        assert_eq!(scheduler.admission.in_flight(), 0);
        assert!(scheduler.tracker.is_empty());
        assert_eq!(scheduler.handle().stats().deliveries_started, 0);
        assert!(transport.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_allows_one_delivery_per_token() {
        let transport = MockTransport::with_delay(Duration::ZERO);
        let scheduler = scheduler(config(50, 1, 4), &transport);
        let handle = scheduler.handle();
        let start = Instant::now();
        let task = tokio::spawn(scheduler.run());

        // Report ticks at +50ms and +100ms; only the first has a token.
        sleep_ms(150).await;
        assert_eq!(transport.starts().len(), 1);

        sleep_ms(1000).await;
        let starts = transport.starts();
        assert_eq!(starts.len(), 2);
        assert!(starts[1] - start >= Duration::from_secs(1));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_slot_drops_tick() {
        let transport = MockTransport::with_delay(Duration::from_millis(500));
        let scheduler = scheduler(config(100, 100, 1), &transport);
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        sleep_ms(250).await;
        assert_eq!(transport.starts().len(), 1);
        assert_eq!(handle.stats().ticks_dropped, 1);

        sleep_ms(300).await;
        assert_eq!(transport.starts().len(), 1);
        assert_eq!(handle.stats().ticks_dropped, 4);

        handle.shutdown();
        let stats = task.await.unwrap();
        // The dropped ticks never ran; only the final flush was added.
        assert_eq!(transport.starts().len(), 2);
        assert_eq!(stats.deliveries_started, 2);
        assert_eq!(stats.ticks_dropped, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_runs_exactly_once() {
        let transport = MockTransport::with_delay(Duration::ZERO);
        let scheduler = scheduler(config(100, 10, 1), &transport);
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        sleep_ms(50).await;
        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert_eq!(handle.state(), SchedulerState::ShuttingDown);

        let stats = task.await.unwrap();
        assert!(!handle.shutdown());
        assert_eq!(handle.state(), SchedulerState::Stopped);
        assert_eq!(stats.final_flushes, 1);
        assert_eq!(transport.starts().len(), 1);
        assert_eq!(transport.batches.lock()[0], vec![Metric::counter("reqs", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_before_final_flush() {
        let transport = MockTransport::with_delay(Duration::from_millis(500));
        let scheduler = scheduler(config(100, 100, 2), &transport);
        let handle = scheduler.handle();
        let start = Instant::now();
        let task = tokio::spawn(scheduler.run());

        sleep_ms(250).await;
        assert_eq!(handle.in_flight(), 2);
        handle.shutdown();

        let stats = task.await.unwrap();
        let starts = transport.starts();
        assert_eq!(starts.len(), 3);
        // Second delivery began at +200ms and ran 500ms.
        assert!(starts[2] - start >= Duration::from_millis(700));
        assert_eq!(stats.deliveries_succeeded, 3);
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_pacing_wait() {
        let transport = MockTransport::with_delay(Duration::ZERO);
        let scheduler = scheduler(config(50, 1, 1), &transport);
        let handle = scheduler.handle();
        let start = Instant::now();
        let task = tokio::spawn(scheduler.run());

        // The tick at +100ms is parked waiting for the token due at +1s.
        sleep_ms(200).await;
        handle.shutdown();
        task.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.starts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_never_exceeds_capacity() {
        let transport = MockTransport::with_delay(Duration::from_millis(250));
        let scheduler = scheduler(config(50, 100, 2), &transport);
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        sleep_ms(2000).await;
        handle.shutdown();
        let stats = task.await.unwrap();

        assert!(transport.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(stats.peak_in_flight, 2);
        assert!(stats.ticks_dropped > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_ticks_feed_final_flush() {
        let transport = MockTransport::with_delay(Duration::ZERO);
        let store = MetricStore::new();
        let config = SchedulerConfig {
            poll_interval: Duration::from_millis(100),
            report_interval: HOUR,
            rate_limit: 100,
            max_in_flight: 1,
        };
        let collector = Collector::new().with_source(TickSource);
        let scheduler = Scheduler::new(
            config,
            store.clone(),
            collector,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        sleep_ms(350).await;
        handle.shutdown();
        let stats = task.await.unwrap();

        assert_eq!(stats.collections, 3);
        assert_eq!(store.get_counter("PollCount").unwrap(), 3);
        assert_eq!(
            transport.batches.lock().last().unwrap(),
            &vec![Metric::counter("PollCount", 3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_does_not_stop_scheduler() {
        let transport = Arc::new(MockTransport {
            fail: true,
            ..MockTransport::default()
        });
        let scheduler = scheduler(config(100, 100, 1), &transport);
        let handle = scheduler.handle();
        let task = tokio::spawn(scheduler.run());

        sleep_ms(350).await;
        assert_eq!(handle.state(), SchedulerState::Running);
        handle.shutdown();
        let stats = task.await.unwrap();

        assert_eq!(stats.deliveries_failed, 4);
        assert_eq!(stats.deliveries_succeeded, 0);
    }
}
