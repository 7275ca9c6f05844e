//! # tally-core
//!
//! Shared building blocks of the tally metrics pipeline.
//!
//! ## Features
//!
//! - **Metric model**: gauges (last write wins) and counters (accumulated deltas)
//! - **Concurrent store**: one explicit [`MetricStore`] per process, safe to share across threads
//! - **Wire codec**: JSON, gzip, optional HMAC-SHA256 signature and RSA encryption
//! - **Buffer pool**: reusable compression buffers
//! - **RPC frames**: the `UpdateMetrics` request/response shapes
//!
//! ## Example
//!
//! ```rust
//! use tally_core::{Decoder, Encoder, MetricStore};
//!
//! let store = MetricStore::new();
//! store.add_counter("reqs", 5).unwrap();
//! store.add_counter("reqs", 3).unwrap();
//! assert_eq!(store.get_counter("reqs").unwrap(), 8);
//!
//! let payload = Encoder::new().encode_snapshot(&store.snapshot()).unwrap();
//! let records = Decoder::new().decode(&payload).unwrap();
//! assert_eq!(records[0].delta, Some(8));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod crypto;
pub mod duration;
pub mod error;
pub mod pool;
pub mod rpc;
pub mod store;
pub mod types;

pub use codec::{Decoder, EncodedPayload, Encoder};
pub use crypto::Signer;
pub use duration::parse_duration;
pub use error::{CoreError, Result};
pub use pool::{BufferPool, PooledBuffer};
pub use store::{MetricStore, Snapshot};
pub use types::{Metric, MetricKind, MetricUpdate, MetricValue, format_gauge};
