//! Request/response frames of the RPC surface.
//!
//! The RPC surface is a single `UpdateMetrics` call carried as a JSON frame
//! over HTTP. Bodies are neither compressed nor signed; the caller's IP
//! travels in the `x-real-ip` metadata header.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Metric;

/// Path the RPC endpoint is mounted on.
pub const RPC_PATH: &str = "/rpc";
/// Name of the only supported method.
pub const METHOD_UPDATE_METRICS: &str = "UpdateMetrics";
/// Metadata header carrying the caller IP.
pub const REAL_IP_METADATA: &str = "x-real-ip";

/// Status codes carried in [`RpcError::code`].
pub mod codes {
    /// Params were missing or malformed.
    pub const INVALID_ARGUMENT: i32 = 3;
    /// Caller IP is missing or outside the trusted subnet.
    pub const PERMISSION_DENIED: i32 = 7;
    /// Method is not known.
    pub const UNIMPLEMENTED: i32 = 12;
    /// Server-side failure.
    pub const INTERNAL: i32 = 13;
}

/// An RPC call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Caller-chosen id echoed in the response.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Reply to an [`RpcRequest`]; exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the request being answered.
    pub id: String,
    /// Method result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Builds a successful response.
    #[must_use]
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Builds a failed response.
    #[must_use]
    pub fn err(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Error shape of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// One of [`codes`].
    pub code: i32,
    /// Human-readable message.
    pub message: String,
}

/// Parameters of `UpdateMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetricsParams {
    /// Records to apply.
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

/// Result of `UpdateMetrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMetricsResult {
    /// Number of records applied.
    pub updated: usize,
}
