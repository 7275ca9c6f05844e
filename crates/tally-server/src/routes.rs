//! Route configuration for the tally server.

use std::sync::Arc;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use tally_core::rpc::RPC_PATH;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    list_metrics, ping, update_batch, update_json, update_plain, value_json, value_plain,
};
use crate::middleware::{
    caller_ip, check_subnet, decrypt_body, gunzip_body, persist_after_ingest, verify_and_sign,
};
use crate::rpc::handle_rpc;
use crate::state::AppState;

/// Create the server router.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Last route_layer wraps outermost.
    let ingest_routes = Router::new()
        .route("/updates/", post(update_batch))
        .route("/update/", post(update_json))
        .route("/update/{type}/{name}/{value}", post(update_plain))
        .route_layer(from_fn_with_state(state.clone(), persist_after_ingest))
        .route_layer(from_fn_with_state(state.clone(), verify_and_sign))
        .route_layer(from_fn(gunzip_body))
        .route_layer(from_fn_with_state(state.clone(), decrypt_body))
        .route_layer(from_fn_with_state(state.clone(), check_subnet));

    let query_routes = Router::new()
        .route("/", get(list_metrics))
        .route("/value/", post(value_json))
        .route("/value/{type}/{name}", get(value_plain))
        .route("/ping", get(ping))
        .route_layer(from_fn(gunzip_body));

    Router::new()
        .merge(ingest_routes)
        .merge(query_routes)
        .route(RPC_PATH, post(handle_rpc))
        .with_state(state)
        .layer(from_fn(caller_ip))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}
