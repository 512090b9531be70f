//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::state::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/insights", get(insights))
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/approvals", get(list_approvals))
        .route("/approvals/{id}", post(approve).delete(reject))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "data": null, "meta": meta(), "error": message.into() })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.status.borrow().clone();
    Json(json!({ "data": status, "meta": meta() }))
}

async fn insights(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.knowledge.snapshot();
    let insights = snapshot.insights();
    Json(json!({
        "data": insights,
        "meta": {
            "total": insights.len(),
            "min_sample_size": snapshot.min_sample_size(),
            "threshold_factors": snapshot.threshold_factors(),
            "version": snapshot.version,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_executions(State(state): State<AppState>, Query(params): Query<ListParams>) -> ApiResult {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let log = state.executions.clone();
    let rows = tokio::task::spawn_blocking(move || log.list_recent(limit))
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            warn!(error = %format!("{e:#}"), "listing executions failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, "execution history unavailable")
        })?;

    Ok(Json(json!({
        "data": rows,
        "meta": { "total": rows.len(), "limit": limit }
    })))
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let log = state.executions.clone();
    let row = tokio::task::spawn_blocking(move || log.get(id))
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            warn!(execution_id = %id, error = %format!("{e:#}"), "reading execution failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, "execution history unavailable")
        })?;

    match row {
        Some(execution) => Ok(Json(json!({ "data": execution, "meta": meta() }))),
        None => Err(error(StatusCode::NOT_FOUND, format!("no execution {id}"))),
    }
}

async fn list_approvals(State(state): State<AppState>) -> Json<Value> {
    let pending = state.approvals.list().await;
    Json(json!({ "data": pending, "meta": { "total": pending.len() } }))
}

async fn approve(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    match state.approvals.approve(id).await {
        Some(entry) => Ok(Json(json!({
            "data": entry,
            "meta": { "message": "policy approved, it runs next cycle" }
        }))),
        None => Err(error(StatusCode::NOT_FOUND, format!("no pending policy {id}"))),
    }
}

async fn reject(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    match state.approvals.reject(id).await {
        Some(entry) => Ok(Json(json!({
            "data": entry,
            "meta": { "message": "policy rejected" }
        }))),
        None => Err(error(StatusCode::NOT_FOUND, format!("no pending policy {id}"))),
    }
}
