//! Dashboard and reload API
//!
//! - `GET /buffer`: in-flight buffer counters per shard
//! - `GET /reload?config=rwswitcher|route`: the live table
//! - `POST /reload?config=rwswitcher|route`: re-read it from the config directory
//! - `GET /score/json`: per-node health and breaker state
//! - `GET /api/bucket/:id`: replicas of one bucket with their health
//! - `GET /route/version`: number of route reloads since startup
//! - `GET /route`, `GET /config`, `GET /metrics`

use crate::proxy::Proxy;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const COMPONENT_SWITCHER: &str = "rwswitcher";
pub const COMPONENT_ROUTE: &str = "route";

#[derive(Debug, Deserialize)]
pub struct ReloadQuery {
    config: Option<String>,
}

pub fn create_router(proxy: Arc<Proxy>) -> Router {
    Router::new()
        .route("/buffer", axum::routing::get(buffer))
        .route(
            "/reload",
            axum::routing::get(show_reloadable).post(reload),
        )
        .route("/score/json", axum::routing::get(score))
        .route("/route", axum::routing::get(route))
        .route("/route/version", axum::routing::get(route_version))
        .route("/api/bucket/:id", axum::routing::get(bucket_detail))
        .route("/config", axum::routing::get(config))
        .route("/metrics", axum::routing::get(metrics))
        .route("/health", axum::routing::get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(proxy)
}

async fn buffer(State(proxy): State<Arc<Proxy>>) -> impl IntoResponse {
    axum::Json(proxy.buffers().snapshot())
}

fn unknown_component(name: Option<&str>) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({
            "error": format!("unknown config component: {}", name.unwrap_or("<none>")),
        })),
    )
        .into_response()
}

async fn show_reloadable(
    State(proxy): State<Arc<Proxy>>,
    Query(query): Query<ReloadQuery>,
) -> axum::response::Response {
    match query.config.as_deref() {
        Some(COMPONENT_SWITCHER) => {
            let table = proxy.dispatcher().switcher().snapshot();
            (StatusCode::OK, axum::Json(json!(table.to_config()))).into_response()
        }
        Some(COMPONENT_ROUTE) => {
            let route = proxy.coordinator().route_snapshot();
            (StatusCode::OK, axum::Json(json!(route))).into_response()
        }
        other => unknown_component(other),
    }
}

async fn reload(
    State(proxy): State<Arc<Proxy>>,
    Query(query): Query<ReloadQuery>,
) -> axum::response::Response {
    let result = match query.config.as_deref() {
        Some(COMPONENT_SWITCHER) => proxy.reload_switch().await,
        Some(COMPONENT_ROUTE) => proxy.reload_route().await,
        other => return unknown_component(other),
    };

    match result {
        Ok(()) => (StatusCode::OK, axum::Json(json!({ "message": "success" }))).into_response(),
        Err(e) => {
            tracing::warn!(component = ?query.config, error = %e, "reload failed");
            (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn score(State(proxy): State<Arc<Proxy>>) -> impl IntoResponse {
    axum::Json(proxy.coordinator().node_status())
}

async fn route(State(proxy): State<Arc<Proxy>>) -> impl IntoResponse {
    let topology = proxy.coordinator().topology();
    axum::Json(json!({
        "numbucket": topology.router().numbucket(),
        "buckets": topology.router().snapshot(),
    }))
}

async fn route_version(State(proxy): State<Arc<Proxy>>) -> impl IntoResponse {
    proxy.coordinator().topology().version().to_string()
}

async fn bucket_detail(
    State(proxy): State<Arc<Proxy>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(bucket) = id.parse::<usize>() else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({ "error": format!("bad bucket id {:?}", id) })),
        )
            .into_response();
    };
    match proxy.coordinator().topology().bucket_status(bucket) {
        Some(status) => axum::Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": format!("no bucket {}", bucket) })),
        )
            .into_response(),
    }
}

/// Effective configuration, with the live switch table
async fn config(State(proxy): State<Arc<Proxy>>) -> impl IntoResponse {
    let mut config = proxy.config().clone();
    config.switch = proxy.dispatcher().switcher().snapshot().to_config();
    axum::Json(config)
}

async fn metrics(State(proxy): State<Arc<Proxy>>) -> impl IntoResponse {
    let mut out = String::new();
    for node in proxy.coordinator().node_status() {
        out += &format!(
            "beanproxy_node_score {{addr=\"{}\"}} {}\n",
            node.addr, node.score
        );
    }
    out += &crate::common::METRICS.to_prometheus();
    (StatusCode::OK, out)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "version": crate::VERSION,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{PROXY_CONFIG_FILE, ROUTE_CONFIG_FILE};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const ROUTE: &str = "numbucket = 1\n[[main]]\naddr = \"127.0.0.1:1\"\nbuckets = [\"0\"]\n";

    fn proxy_in(dir: &TempDir, proxy_toml: &str) -> Arc<Proxy> {
        std::fs::write(dir.path().join(PROXY_CONFIG_FILE), proxy_toml).unwrap();
        std::fs::write(dir.path().join(ROUTE_CONFIG_FILE), ROUTE).unwrap();
        Proxy::from_confdir(dir.path()).unwrap()
    }

    async fn call(proxy: &Arc<Proxy>, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = create_router(proxy.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_buffer_shape() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_in(&dir, "");
        let (status, body) = call(&proxy, Method::GET, "/buffer").await;
        assert_eq!(status, StatusCode::OK);
        let shards = body.as_object().unwrap();
        assert_eq!(shards.len(), 4);
        for usage in shards.values() {
            assert_eq!(usage["Count"], 0);
            assert_eq!(usage["Size"], 0);
        }
    }

    #[tokio::test]
    async fn test_reload_switcher() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_in(&dir, "");

        std::fs::write(
            dir.path().join(PROXY_CONFIG_FILE),
            "[switch]\ndefault_storage = \"BRW\"\n[switch.prefixes]\nBRW = [\"/pinned/\"]\n",
        )
        .unwrap();
        let (status, body) = call(&proxy, Method::POST, "/reload?config=rwswitcher").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "success");

        let (_, table) = call(&proxy, Method::GET, "/reload?config=rwswitcher").await;
        assert_eq!(table["default_storage"], "BRW");
        assert_eq!(table["prefixes"]["BRW"][0], "/pinned/");
    }

    #[tokio::test]
    async fn test_reload_rejects_unusable_table() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_in(&dir, "");

        // No new backend is configured, so a mirrored stage cannot be served
        std::fs::write(
            dir.path().join(PROXY_CONFIG_FILE),
            "[switch.prefixes]\nBRW_CW = [\"/user/\"]\n",
        )
        .unwrap();
        let (status, body) = call(&proxy, Method::POST, "/reload?config=rwswitcher").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("new backend"));

        let (_, table) = call(&proxy, Method::GET, "/reload?config=rwswitcher").await;
        assert!(table["prefixes"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_route_and_unknown_component() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_in(&dir, "");

        std::fs::write(
            dir.path().join(ROUTE_CONFIG_FILE),
            "numbucket = 2\n[[main]]\naddr = \"127.0.0.1:1\"\nbuckets = [\"0\", \"1\"]\n",
        )
        .unwrap();
        let (status, _) = call(&proxy, Method::POST, "/reload?config=route").await;
        assert_eq!(status, StatusCode::OK);
        let (_, route) = call(&proxy, Method::GET, "/route").await;
        assert_eq!(route["numbucket"], 2);

        let (status, _) = call(&proxy, Method::POST, "/reload?config=everything").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_route_version_counts_reloads() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_in(&dir, "");
        let (status, version) = call(&proxy, Method::GET, "/route/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(version, 0);

        let (status, _) = call(&proxy, Method::POST, "/reload?config=route").await;
        assert_eq!(status, StatusCode::OK);
        let (_, version) = call(&proxy, Method::GET, "/route/version").await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_bucket_detail() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_in(&dir, "");
        let (status, body) = call(&proxy, Method::GET, "/api/bucket/0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bucket"], 0);
        assert_eq!(body["mains"][0]["addr"], "127.0.0.1:1");
        assert_eq!(body["mains"][0]["state"], "closed");
        assert!(body["backups"].as_array().unwrap().is_empty());

        let (status, _) = call(&proxy, Method::GET, "/api/bucket/5").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&proxy, Method::GET, "/api/bucket/zero").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_score_lists_nodes() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_in(&dir, "");
        let (status, body) = call(&proxy, Method::GET, "/score/json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["addr"], "127.0.0.1:1");
    }
}
