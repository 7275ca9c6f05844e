//! HTTP handlers for the tally server.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::Html;
use tally_core::rpc::UpdateMetricsResult;
use tally_core::{Metric, MetricKind, MetricUpdate, MetricValue, format_gauge};
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::middleware::CallerIp;
use crate::state::AppState;

/// Applies a JSON array of metrics atomically.
///
/// POST /updates/
pub async fn update_batch(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIp>,
    body: Bytes,
) -> Result<Json<UpdateMetricsResult>> {
    let metrics: Vec<Metric> = serde_json::from_slice(&body)?;
    let updates = metrics
        .iter()
        .map(Metric::to_update)
        .collect::<tally_core::Result<Vec<_>>>()?;

    state.store.apply_batch(&updates)?;
    state.audit_ingest(&updates, &caller.0);
    debug!(count = updates.len(), ip = %caller.0, "batch applied");

    Ok(Json(UpdateMetricsResult {
        updated: updates.len(),
    }))
}

/// Applies one JSON metric and returns its stored value.
///
/// POST /update/
pub async fn update_json(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIp>,
    body: Bytes,
) -> Result<Json<Metric>> {
    let metric: Metric = serde_json::from_slice(&body)?;
    let update = metric.to_update()?;

    state.store.apply(&update)?;
    state.audit_ingest(std::slice::from_ref(&update), &caller.0);

    let current = state.store.get(update.kind(), update.name())?;
    Ok(Json(Metric::from_value(update.name(), current)))
}

/// Applies one metric given in the path.
///
/// POST /update/{type}/{name}/{value}
pub async fn update_plain(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIp>,
    Path((kind, name, raw)): Path<(String, String, String)>,
) -> Result<StatusCode> {
    let kind: MetricKind = kind.parse()?;
    if name.is_empty() {
        return Err(ServerError::NotFound {
            kind: kind.to_string(),
            name,
        });
    }
    let update = match kind.parse_value(&raw)? {
        MetricValue::Gauge(value) => MetricUpdate::Gauge { name, value },
        MetricValue::Counter(delta) => MetricUpdate::Counter { name, delta },
    };

    state.store.apply(&update)?;
    state.audit_ingest(std::slice::from_ref(&update), &caller.0);
    Ok(StatusCode::OK)
}

/// Looks up a metric named in a JSON body.
///
/// POST /value/
pub async fn value_json(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Metric>> {
    let query: Metric = serde_json::from_slice(&body)?;
    let kind = query
        .kind()
        .map_err(|_| ServerError::BadRequest(format!("unknown metric type: {}", query.kind)))?;
    let value = state.store.get(kind, &query.id)?;
    Ok(Json(Metric::from_value(query.id, value)))
}

/// Returns a metric's value as plain text.
///
/// GET /value/{type}/{name}
pub async fn value_plain(
    State(state): State<Arc<AppState>>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<String> {
    let kind: MetricKind = kind
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("unknown metric type: {kind}")))?;
    let value = state.store.get(kind, &name)?;
    Ok(value.to_string())
}

/// Lists every metric as an HTML page.
///
/// GET /
pub async fn list_metrics(State(state): State<Arc<AppState>>) -> Html<String> {
    let snapshot = state.store.snapshot();
    let mut page = String::from(
        "<!DOCTYPE html>\n<html><head><title>Metrics</title></head><body>\n<ul>\n",
    );
    for (name, delta) in &snapshot.counters {
        let _ = writeln!(page, "<li>{}: {delta}</li>", escape_html(name));
    }
    for (name, value) in &snapshot.gauges {
        let _ = writeln!(
            page,
            "<li>{}: {}</li>",
            escape_html(name),
            format_gauge(*value)
        );
    }
    page.push_str("</ul>\n</body></html>\n");
    Html(page)
}

/// Reports whether the snapshot database answers.
///
/// GET /ping
pub async fn ping(State(state): State<Arc<AppState>>) -> Result<StatusCode> {
    state.persistence.ping().await?;
    Ok(StatusCode::OK)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&\"'"), "a&lt;b&gt;&amp;&quot;&#39;");
        assert_eq!(escape_html("Alloc"), "Alloc");
    }
}
