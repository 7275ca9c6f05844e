//! Error types for the tally-core crate.

use thiserror::Error;

use crate::types::MetricKind;

/// Errors raised by the store and the wire codec.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No metric of the requested kind exists under this name.
    #[error("{kind} metric not found: {name}")]
    MetricNotFound {
        /// Kind that was looked up.
        kind: MetricKind,
        /// The missing metric name.
        name: String,
    },

    /// The name is already bound to a metric of a different kind.
    #[error("metric {name} is already a {existing}")]
    KindConflict {
        /// The conflicting metric name.
        name: String,
        /// Kind currently stored under the name.
        existing: MetricKind,
    },

    /// A record carries an empty name.
    #[error("metric name cannot be empty")]
    EmptyName,

    /// The metric type string is neither `gauge` nor `counter`.
    #[error("unsupported metric type: {kind}")]
    UnsupportedKind {
        /// The type string as received.
        kind: String,
    },

    /// A record lacks the field its kind requires.
    #[error("{kind} {name} has no {field}")]
    MissingValue {
        /// The record name.
        name: String,
        /// The record kind.
        kind: MetricKind,
        /// The absent field, `value` or `delta`.
        field: &'static str,
    },

    /// A textual value could not be parsed for its kind.
    #[error("invalid {kind} value: {raw}")]
    InvalidValue {
        /// The target kind.
        kind: MetricKind,
        /// The rejected input.
        raw: String,
    },

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// gzip compression or decompression failed.
    #[error("compression error: {reason}")]
    Compression {
        /// What went wrong.
        reason: String,
    },

    /// The HMAC signature is malformed or does not match.
    #[error("signature error: {reason}")]
    Signature {
        /// What went wrong.
        reason: String,
    },

    /// RSA encryption or decryption failed.
    #[error("crypto error: {reason}")]
    Crypto {
        /// What went wrong.
        reason: String,
    },

    /// A key file could not be read or parsed.
    #[error("cannot load key from {path}: {reason}")]
    Key {
        /// Path of the key file.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_metric_not_found() {
        let err = CoreError::MetricNotFound {
            kind: MetricKind::Gauge,
            name: "temp".to_string(),
        };
        assert_eq!(err.to_string(), "gauge metric not found: temp");
    }

    #[test]
    fn error_display_kind_conflict() {
        let err = CoreError::KindConflict {
            name: "reqs".to_string(),
            existing: MetricKind::Counter,
        };
        assert_eq!(err.to_string(), "metric reqs is already a counter");
    }

    #[test]
    fn error_display_unsupported_kind() {
        let err = CoreError::UnsupportedKind {
            kind: "histogram".to_string(),
        };
        assert_eq!(err.to_string(), "unsupported metric type: histogram");
    }

    #[test]
    fn error_display_missing_value() {
        let err = CoreError::MissingValue {
            name: "reqs".to_string(),
            kind: MetricKind::Counter,
            field: "delta",
        };
        assert_eq!(err.to_string(), "counter reqs has no delta");
    }

    #[test]
    fn error_display_key() {
        let err = CoreError::Key {
            path: "/tmp/key.pem".to_string(),
            reason: "invalid PEM".to_string(),
        };
        assert_eq!(err.to_string(), "cannot load key from /tmp/key.pem: invalid PEM");
    }

    #[test]
    fn error_from_serde() {
        let serde_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err = CoreError::from(serde_err);
        assert!(matches!(err, CoreError::Serialization(_)));
    }
}
