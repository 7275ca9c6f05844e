//! The `UpdateMetrics` RPC endpoint.
//!
//! Every outcome, failures included, is answered with HTTP 200 and a
//! response frame; the frame's `error` carries the status.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use tally_core::rpc::{
    METHOD_UPDATE_METRICS, REAL_IP_METADATA, RpcRequest, RpcResponse, UpdateMetricsParams,
    UpdateMetricsResult, codes,
};
use tally_core::{Metric, MetricUpdate};
use tracing::{debug, warn};

use crate::state::AppState;

/// Handles one RPC frame.
///
/// POST /rpc
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(RpcResponse::err(
                String::new(),
                codes::INVALID_ARGUMENT,
                format!("malformed request frame: {e}"),
            ));
        }
    };

    let real_ip = headers
        .get(REAL_IP_METADATA)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.trust.admit(real_ip) {
        warn!(real_ip = ?real_ip, error = %e, "rpc call refused");
        return Json(RpcResponse::err(
            request.id,
            codes::PERMISSION_DENIED,
            e.to_string(),
        ));
    }

    let response = match request.method.as_str() {
        METHOD_UPDATE_METRICS => {
            update_metrics(&state, &request, real_ip.unwrap_or_default()).await
        }
        other => RpcResponse::err(
            request.id.clone(),
            codes::UNIMPLEMENTED,
            format!("unknown method: {other}"),
        ),
    };
    Json(response)
}

async fn update_metrics(state: &AppState, request: &RpcRequest, ip: &str) -> RpcResponse {
    let parsed = request
        .params
        .clone()
        .map(serde_json::from_value::<UpdateMetricsParams>);
    let params = match parsed {
        Some(Ok(params)) => params,
        Some(Err(e)) => {
            return RpcResponse::err(
                request.id.clone(),
                codes::INVALID_ARGUMENT,
                format!("malformed params: {e}"),
            );
        }
        None => {
            return RpcResponse::err(
                request.id.clone(),
                codes::INVALID_ARGUMENT,
                "missing params",
            );
        }
    };

    let updates = match to_updates(&params.metrics) {
        Ok(updates) => updates,
        Err(e) => {
            return RpcResponse::err(request.id.clone(), codes::INVALID_ARGUMENT, e.to_string());
        }
    };

    if let Err(e) = state.store.apply_batch(&updates) {
        return RpcResponse::err(request.id.clone(), codes::INVALID_ARGUMENT, e.to_string());
    }
    state.audit_ingest(&updates, ip);
    if !updates.is_empty() {
        state.persistence.after_ingest().await;
    }
    debug!(id = %request.id, count = updates.len(), "rpc batch applied");

    let result = UpdateMetricsResult {
        updated: updates.len(),
    };
    match serde_json::to_value(result) {
        Ok(value) => RpcResponse::ok(request.id.clone(), value),
        Err(e) => RpcResponse::err(request.id.clone(), codes::INTERNAL, e.to_string()),
    }
}

fn to_updates(metrics: &[Metric]) -> tally_core::Result<Vec<MetricUpdate>> {
    metrics
        .iter()
        .filter(|m| !m.id.is_empty())
        .map(Metric::to_update)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ids_are_skipped() {
        let metrics = vec![
            Metric::counter("", 5),
            Metric::counter("PollCount", 1),
            Metric::gauge("", 1.0),
        ];
        let updates = to_updates(&metrics).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name(), "PollCount");
    }

    #[test]
    fn test_invalid_record_fails_the_call() {
        let mut broken = Metric::gauge("Alloc", 1.0);
        broken.value = None;
        assert!(to_updates(&[Metric::counter("a", 1), broken]).is_err());
    }
}
