//! REST API of the storage node
//!
//! - `GET /kv/:key`: value body, flags and revision in `x-flags` / `x-revision`
//! - `PUT /kv/:key`: store the body; `409 Conflict` on a stale revision
//! - `DELETE /kv/:key`: `404` when there was nothing live to delete
//! - `GET /kv/:key/meta`: metadata as JSON, tombstones included

use crate::common::{validate_key, Error, Item, ProtocolConfig};
use crate::node::{lock, SharedStore};
use crate::proxy::backend::{HEADER_FLAGS, HEADER_REVISION};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct NodeState {
    pub store: SharedStore,
    pub mc: ProtocolConfig,
}

pub fn create_router(store: SharedStore, mc: ProtocolConfig) -> Router {
    let body_limit = mc.body_max;
    Router::new()
        .route(
            "/kv/:key",
            axum::routing::get(get_value).put(put_value).delete(delete_value),
        )
        .route("/kv/:key/meta", axum::routing::get(get_meta))
        .route("/stats", axum::routing::get(stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(NodeState { store, mc })
}

fn error_response(err: Error) -> Response {
    (
        err.to_http_status(),
        axum::Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn not_found(key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({ "error": format!("key not found: {}", key) })),
    )
        .into_response()
}

fn header<T: std::str::FromStr + Default>(headers: &HeaderMap, name: &str) -> Result<T, Error> {
    match headers.get(name) {
        None => Ok(T::default()),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("bad {} header", name))),
    }
}

async fn get_value(State(state): State<NodeState>, Path(key): Path<String>) -> Response {
    if let Err(e) = validate_key(&key, state.mc.max_key_len) {
        return error_response(e);
    }
    match lock(&state.store).get(&key) {
        Some(item) => (
            StatusCode::OK,
            [
                (HEADER_FLAGS, item.flags.to_string()),
                (HEADER_REVISION, item.rev.to_string()),
            ],
            item.value,
        )
            .into_response(),
        None => not_found(&key),
    }
}

async fn put_value(
    State(state): State<NodeState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = validate_key(&key, state.mc.max_key_len) {
        return error_response(e);
    }
    let (flags, rev) = match (header(&headers, HEADER_FLAGS), header(&headers, HEADER_REVISION)) {
        (Ok(flags), Ok(rev)) => (flags, rev),
        (Err(e), _) | (_, Err(e)) => return error_response(e),
    };

    let result = lock(&state.store).set(&key, &Item::new(flags, body).with_rev(rev));
    match result {
        Ok(rev) => (StatusCode::OK, axum::Json(json!({ "key": key, "revision": rev })))
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_value(State(state): State<NodeState>, Path(key): Path<String>) -> Response {
    if let Err(e) = validate_key(&key, state.mc.max_key_len) {
        return error_response(e);
    }
    let found = lock(&state.store).delete(&key);
    if found {
        (StatusCode::OK, axum::Json(json!({ "deleted": key }))).into_response()
    } else {
        not_found(&key)
    }
}

async fn get_meta(State(state): State<NodeState>, Path(key): Path<String>) -> Response {
    if let Err(e) = validate_key(&key, state.mc.max_key_len) {
        return error_response(e);
    }
    let meta = lock(&state.store).get_meta(&key);
    match meta {
        Some(meta) => (StatusCode::OK, axum::Json(meta)).into_response(),
        None => not_found(&key),
    }
}

async fn stats(State(state): State<NodeState>) -> impl IntoResponse {
    let stats = lock(&state.store).stats();
    axum::Json(stats)
}
