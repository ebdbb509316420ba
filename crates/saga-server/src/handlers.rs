use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use saga_core::{Message, SessionId};
use saga_engine::AgentInfo;
use saga_pool::PoolMetrics;
use saga_store::{StoreError, StoreHealth};
use saga_telemetry::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::connection;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub store: StoreHealth,
    pub agents: usize,
    pub connections: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolMetrics>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Upgrade to the streaming channel for one session.
pub async fn stream(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let session_id = SessionId::from_raw(session_id);
    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            session_id,
            state.router,
            state.connections,
            state.max_send_queue,
            state.heartbeat,
            state.shutdown,
        )
    })
}

/// 200 when the session store is live, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let store = state.router.store().health().await;
    let (code, status) = if store.live {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    let report = HealthReport {
        status: status.to_string(),
        store,
        agents: state.router.registry().len(),
        connections: state.connections.count(),
    };
    (code, Json(report))
}

pub async fn agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    let agents: Vec<AgentInfo> = state.router.registry().describe();
    Json(json!({ "agents": agents }))
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(MetricsReport {
        pool: state.router.store().pool_metrics(),
        metrics: state.router.metrics().snapshot(),
    })
}

pub async fn history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let messages: Vec<Message> = state
        .router
        .store()
        .history(&SessionId::from_raw(session_id), query.limit)
        .await
        .map_err(store_error_response)?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, Response> {
    let existed = state
        .router
        .store()
        .close(&SessionId::from_raw(session_id))
        .await
        .map_err(store_error_response)?;
    Ok(if existed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

fn store_error_response(e: StoreError) -> Response {
    let code = match &e {
        StoreError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({
        "error": e.error_kind(),
        "message": e.to_string(),
        "retryable": e.is_retryable(),
    });
    (code, Json(body)).into_response()
}
