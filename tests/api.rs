//! HTTP surface: JSON envelope, approvals and the Prometheus scrape.

mod common;

use std::sync::Arc;

use autoheal::api::{self, state::AppState};
use autoheal::config::ConfigWatcher;
use autoheal::knowledge::KnowledgeBase;
use autoheal::metrics::HealMetrics;
use autoheal::orchestrator::Orchestrator;
use autoheal::storage::{self, ExecutionLog};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{ScriptedBackend, ScriptedTelemetry};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Fixture {
    orchestrator: Orchestrator,
    router: Router,
    _dir: tempfile::TempDir,
}

/// An orchestrator that has seen a CPU burst on `web-1` and the router over
/// its state.
async fn fixture() -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let config = common::test_config(dir.path());
    let telemetry = ScriptedTelemetry::new();
    telemetry.burst("cpu_percent", "web-1", 97.0, 5);

    let pool = storage::open_pool(&config.knowledge.db_path)?;
    let (knowledge, _writer) = KnowledgeBase::open(pool.clone(), &config.knowledge).await?;
    let executions = ExecutionLog::new(pool);
    let metrics = HealMetrics::new()?;
    let orchestrator = Orchestrator::new(
        ConfigWatcher::fixed(config),
        telemetry,
        Arc::new(ScriptedBackend::new()),
        knowledge.clone(),
        executions.clone(),
        metrics.clone(),
    );
    let router = api::router(AppState {
        status: orchestrator.status(),
        knowledge,
        executions,
        approvals: orchestrator.approvals(),
        metrics,
    });
    Ok(Fixture {
        orchestrator,
        router,
        _dir: dir,
    })
}

async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_and_status() -> anyhow::Result<()> {
    let mut f = fixture().await?;

    let (code, body) = send(&f.router, "GET", "/api/v1/health").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["meta"]["timestamp"].is_string());

    f.orchestrator.run_cycle(&CancellationToken::new()).await;
    let (code, body) = send(&f.router, "GET", "/api/v1/status").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["data"]["phase"], "idle");
    assert_eq!(body["data"]["cycle"], 1);
    assert_eq!(body["data"]["last_cycle"]["violations"], 5);
    Ok(())
}

#[tokio::test]
async fn test_approve_then_reject_is_not_found() -> anyhow::Result<()> {
    let mut f = fixture().await?;
    f.orchestrator.run_cycle(&CancellationToken::new()).await;

    let (code, body) = send(&f.router, "GET", "/api/v1/approvals").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
    let id = body["data"][0]["policy"]["id"].as_str().unwrap().to_string();

    let (code, _) = send(&f.router, "POST", &format!("/api/v1/approvals/{id}")).await;
    assert_eq!(code, StatusCode::OK);

    let (code, body) = send(&f.router, "DELETE", &format!("/api/v1/approvals/{id}")).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert!(body["data"].is_null());
    assert!(body["error"].as_str().unwrap().contains(&id));
    Ok(())
}

#[tokio::test]
async fn test_executions_and_insights_start_empty() -> anyhow::Result<()> {
    let f = fixture().await?;

    let (code, body) = send(&f.router, "GET", "/api/v1/executions?limit=5000").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["meta"]["limit"], 500);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(0));

    let missing = uuid::Uuid::new_v4();
    let (code, _) = send(&f.router, "GET", &format!("/api/v1/executions/{missing}")).await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let (code, body) = send(&f.router, "GET", "/api/v1/insights").await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 0);
    assert_eq!(body["meta"]["min_sample_size"], 1);
    assert_eq!(body["meta"]["threshold_factors"], serde_json::json!({}));
    Ok(())
}

#[tokio::test]
async fn test_metrics_scrape_and_unknown_route() -> anyhow::Result<()> {
    let mut f = fixture().await?;
    f.orchestrator.run_cycle(&CancellationToken::new()).await;

    let response = f
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let text = String::from_utf8(bytes.to_vec())?;
    assert!(text.contains("autoheal_cycles_total{result=\"completed\"} 1"));
    assert!(text.contains("autoheal_violations_detected_total 5"));
    assert!(text.contains("autoheal_pending_approvals 1"));

    let (code, _) = send(&f.router, "GET", "/nope").await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    Ok(())
}
