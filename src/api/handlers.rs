use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use super::AppState;
use crate::pipeline::{Pipeline, RawRequest};

/// 请求体上限，OpenRTB 请求远小于此
const MAX_BODY_BYTES: usize = 1 << 20;

/// **健康检查**：缓存状态与当前创意数
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cache = &state.services.cache;
    let snapshot = cache.snapshot();
    Json(json!({
        "cache": cache.state().as_str(),
        "banners": snapshot.len(),
        "refreshed_at": snapshot.refreshed_at(),
    }))
}

/// **执行一条投放流水线**
///
/// 任意方法都接受，由 Input 自己决定读取查询串还是请求体。
pub async fn handle_pipeline(state: Arc<AppState>, pipeline: Arc<Pipeline>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (parts, body) = request.into_parts();

    let query = match Query::<HashMap<String, String>>::try_from_uri(&parts.uri) {
        Ok(Query(query)) => query,
        Err(rejection) => return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response(),
    };
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(error) => {
            debug!(route = pipeline.name(), %error, "unreadable request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, error.to_string()).into_response();
        }
    };

    let raw = RawRequest {
        method: parts.method,
        headers: parts.headers,
        query,
        body,
        peer,
    };
    pipeline.handle(raw, &state.services).await
}
