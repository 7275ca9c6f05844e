//! Core types for the metric pipeline.
//!
//! This module provides the types shared by the agent and the server:
//! - [`MetricKind`]: gauge or counter
//! - [`Metric`]: the wire record exchanged as JSON
//! - [`MetricUpdate`]: a validated, typed mutation derived from a record
//! - [`MetricValue`]: the value held by the store under one name

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// The two kinds of metric understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Point-in-time value, last write wins.
    Gauge,
    /// Accumulating integer, updated by adding deltas.
    Counter,
}

impl MetricKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }

    /// Parses a textual value for this kind.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidValue` if `raw` is not a valid number for the
    /// kind, or is a negative counter delta.
    pub fn parse_value(self, raw: &str) -> Result<MetricValue> {
        let invalid = || CoreError::InvalidValue {
            kind: self,
            raw: raw.to_string(),
        };
        match self {
            Self::Gauge => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(MetricValue::Gauge)
                .ok_or_else(invalid),
            Self::Counter => raw
                .parse::<i64>()
                .ok()
                .filter(|d| *d >= 0)
                .map(MetricValue::Counter)
                .ok_or_else(invalid),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            other => Err(CoreError::UnsupportedKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A value held by the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Current gauge reading.
    Gauge(f64),
    /// Accumulated counter total.
    Counter(i64),
}

impl MetricValue {
    /// Returns the kind of this value.
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge(v) => f.write_str(&format_gauge(*v)),
            Self::Counter(v) => write!(f, "{v}"),
        }
    }
}

/// Renders a gauge with at most four fractional digits and no trailing zeros.
#[must_use]
pub fn format_gauge(value: f64) -> String {
    let text = format!("{value:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

/// The JSON record exchanged between agent and server.
///
/// `type` is kept as received so that an unknown kind can be reported
/// separately from malformed JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name.
    pub id: String,
    /// `gauge` or `counter`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Counter delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    /// Gauge value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    /// Creates a gauge record.
    #[must_use]
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge.as_str().to_string(),
            delta: None,
            value: Some(value),
        }
    }

    /// Creates a counter record.
    #[must_use]
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter.as_str().to_string(),
            delta: Some(delta),
            value: None,
        }
    }

    /// Creates a record carrying `value` under `id`.
    #[must_use]
    pub fn from_value(id: impl Into<String>, value: MetricValue) -> Self {
        match value {
            MetricValue::Gauge(v) => Self::gauge(id, v),
            MetricValue::Counter(d) => Self::counter(id, d),
        }
    }

    /// Parses the record's kind.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnsupportedKind` for anything but `gauge` or `counter`.
    pub fn kind(&self) -> Result<MetricKind> {
        self.kind.parse()
    }

    /// Validates the record and converts it into a store mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or the kind is unknown. A
    /// missing required field or a negative counter delta is also refused.
    pub fn to_update(&self) -> Result<MetricUpdate> {
        if self.id.is_empty() {
            return Err(CoreError::EmptyName);
        }
        let kind = self.kind()?;
        let missing = |field| CoreError::MissingValue {
            name: self.id.clone(),
            kind,
            field,
        };
        match kind {
            MetricKind::Gauge => {
                let value = self.value.ok_or_else(|| missing("value"))?;
                Ok(MetricUpdate::Gauge {
                    name: self.id.clone(),
                    value,
                })
            }
            MetricKind::Counter => {
                let delta = self.delta.ok_or_else(|| missing("delta"))?;
                // Counters only grow.
                if delta < 0 {
                    return Err(CoreError::InvalidValue {
                        kind,
                        raw: delta.to_string(),
                    });
                }
                Ok(MetricUpdate::Counter {
                    name: self.id.clone(),
                    delta,
                })
            }
        }
    }
}

/// A validated mutation to apply to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricUpdate {
    /// Overwrite a gauge.
    Gauge {
        /// Metric name.
        name: String,
        /// New value.
        value: f64,
    },
    /// Add a delta to a counter.
    Counter {
        /// Metric name.
        name: String,
        /// Amount to add.
        delta: i64,
    },
}

impl MetricUpdate {
    /// Returns the metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Gauge { name, .. } | Self::Counter { name, .. } => name,
        }
    }

    /// Returns the metric kind.
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge { .. } => MetricKind::Gauge,
            Self::Counter { .. } => MetricKind::Counter,
        }
    }
}
