//! # tally-server
//!
//! Metrics collector server.
//!
//! Agents push gauges and counters over HTTP or the RPC frame; the server
//! keeps them in a [`MetricStore`](tally_core::MetricStore), serves lookups
//! and snapshots the store to a file or PostgreSQL.
//!
//! ## Features
//!
//! - **Ingest**: JSON batches, single JSON records and plain-text path updates
//! - **Trust**: subnet filter on `X-Real-IP`, HMAC-SHA256 verification, RSA decryption
//! - **Persistence**: periodic or per-ingest snapshots with restore on startup
//! - **Audit**: every accepted update fans out to file, HTTP and tracing observers
//! - **Lookups**: JSON and plain-text value queries plus an HTML listing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod persist;
pub mod routes;
pub mod rpc;
pub mod server;
pub mod state;
pub mod trust;

pub use audit::{
    AuditEvent, AuditObserver, AuditPublisher, FileAuditObserver, HttpAuditObserver,
    TracingAuditObserver,
};
pub use config::{ServerArgs, ServerConfig, ServerFileConfig};
pub use error::{Result, ServerError};
pub use persist::{FileSink, PersistenceSync, PgSink, SnapshotSink, SyncMode};
pub use routes::create_router;
pub use server::TallyServer;
pub use state::AppState;
pub use trust::TrustPolicy;
