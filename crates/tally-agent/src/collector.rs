//! Metric sources sampled on every collection tick.
//!
//! This module provides the [`MetricSource`] trait and the two built-in
//! sources: [`RuntimeSource`] for the agent process itself and
//! [`SystemSource`] for host-wide memory and CPU.

use sysinfo::{Pid, ProcessesToUpdate, System};
use tally_core::{MetricStore, MetricUpdate};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Trait for metric sources.
///
/// A source returns one batch of updates per call; the [`Collector`] applies
/// it to the store atomically.
pub trait MetricSource: Send {
    /// Samples the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying counters cannot be read.
    fn collect(&mut self) -> Result<Vec<MetricUpdate>>;

    /// Returns the name of this source for logging purposes.
    fn name(&self) -> &'static str;

    /// Samples the source and applies the result to `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling or the store update fails.
    fn collect_into(&mut self, store: &MetricStore) -> Result<usize> {
        let updates = self.collect()?;
        store.apply_batch(&updates)?;
        Ok(updates.len())
    }
}

fn gauge(name: impl Into<String>, value: f64) -> MetricUpdate {
    MetricUpdate::Gauge {
        name: name.into(),
        value,
    }
}

/// Samples the agent's own process: memory footprint, CPU, disk IO and
/// uptime, plus the `PollCount` counter and a `RandomValue` gauge.
#[derive(Debug)]
pub struct RuntimeSource {
    system: System,
    pid: Option<Pid>,
}

impl RuntimeSource {
    /// Creates a runtime source for the current process.
    #[must_use]
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| warn!(error = %e, "cannot determine own pid, process metrics disabled"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for RuntimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for RuntimeSource {
    fn collect(&mut self) -> Result<Vec<MetricUpdate>> {
        let mut updates = vec![
            MetricUpdate::Counter {
                name: "PollCount".to_string(),
                delta: 1,
            },
            gauge("RandomValue", rand::random::<f64>()),
        ];

        let Some(pid) = self.pid else {
            return Ok(updates);
        };

        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid).ok_or_else(|| AgentError::Sampling {
            source_name: self.name(),
            reason: format!("process {pid} not visible"),
        })?;

        let disk = process.disk_usage();
        updates.extend([
            gauge("ResidentMemory", process.memory() as f64),
            gauge("VirtualMemory", process.virtual_memory() as f64),
            gauge("ProcessCPU", f64::from(process.cpu_usage())),
            gauge("DiskReadBytes", disk.total_read_bytes as f64),
            gauge("DiskWrittenBytes", disk.total_written_bytes as f64),
            gauge("RunTime", process.run_time() as f64),
        ]);
        Ok(updates)
    }

    fn name(&self) -> &'static str {
        "runtime"
    }
}

/// Samples host memory, per-CPU utilization and load average.
#[derive(Debug)]
pub struct SystemSource {
    system: System,
}

impl SystemSource {
    /// Creates a system source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for SystemSource {
    fn collect(&mut self) -> Result<Vec<MetricUpdate>> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(AgentError::Sampling {
                source_name: self.name(),
                reason: "memory totals unavailable".to_string(),
            });
        }

        let mut updates = vec![
            gauge("TotalMemory", total as f64),
            gauge("FreeMemory", self.system.free_memory() as f64),
            gauge("AvailableMemory", self.system.available_memory() as f64),
            gauge("LoadAverage1", System::load_average().one),
        ];
        updates.extend(
            self.system
                .cpus()
                .iter()
                .enumerate()
                .map(|(i, cpu)| gauge(format!("CPUutilization{}", i + 1), f64::from(cpu.cpu_usage()))),
        );
        Ok(updates)
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Updates applied across all sources.
    pub applied: usize,
    /// Sources that failed and were skipped.
    pub failed: usize,
}

/// Runs every registered source against a store.
///
/// A failing source is logged and skipped; the others still run.
#[derive(Default)]
pub struct Collector {
    sources: Vec<Box<dyn MetricSource>>,
}

impl Collector {
    /// Creates a collector with no sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collector with the runtime and system sources.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new()
            .with_source(RuntimeSource::new())
            .with_source(SystemSource::new())
    }

    /// Adds a source.
    #[must_use]
    pub fn with_source(mut self, source: impl MetricSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Returns the number of registered sources.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Samples every source into `store`.
    pub fn collect(&mut self, store: &MetricStore) -> CollectReport {
        let mut report = CollectReport::default();
        for source in &mut self.sources {
            match source.collect_into(store) {
                Ok(applied) => report.applied += applied,
                Err(e) => {
                    warn!(source = source.name(), error = %e, "metric source failed, skipping");
                    report.failed += 1;
                }
            }
        }
        debug!(applied = report.applied, failed = report.failed, "collection pass finished");
        report
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("Collector").field("sources", &names).finish()
    }
}
