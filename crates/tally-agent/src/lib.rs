//! # tally-agent
//!
//! Periodic metrics agent.
//!
//! The agent samples its own process and the host into a local
//! [`MetricStore`](tally_core::MetricStore) on every collection tick and
//! pushes a snapshot of the store to a tally server on every report tick.
//!
//! ## Features
//!
//! - **Sources**: process memory, CPU and disk IO; host memory, load and per-CPU utilization
//! - **Pacing**: one shared token bucket limits collection and report actions per second
//! - **Backpressure**: at most `max_in_flight` deliveries; a report tick with no free slot is dropped
//! - **Graceful shutdown**: in-flight deliveries drain, then one final flush
//! - **Transports**: gzip JSON over HTTP (optionally signed and RSA-encrypted) or the RPC frame

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod collector;
pub mod config;
pub mod error;
pub mod pacer;
pub mod scheduler;
pub mod transport;

pub use admission::{Admission, Slot};
pub use collector::{CollectReport, Collector, MetricSource, RuntimeSource, SystemSource};
pub use config::{AgentArgs, AgentConfig, AgentFileConfig, TransportKind};
pub use error::{AgentError, Result};
pub use pacer::Pacer;
pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerHandle, SchedulerState, SchedulerStats, StatsSnapshot,
};
pub use transport::{HttpTransport, RpcTransport, Transport, build_transport, outbound_ip};
