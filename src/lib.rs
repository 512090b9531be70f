//! autoheal -- an autonomic self-healing control loop.
//!
//! A MAPE-K cycle observes health signals ([`monitor`]), diagnoses root
//! causes ([`analyzer`]), ranks remediation policies ([`planner`]), runs them
//! transactionally with compensating rollback ([`executor`]) and learns from
//! the outcomes ([`knowledge`]). [`orchestrator`] drives the cycle; the
//! telemetry source and the enforcement backend are supplied by the caller.

pub mod analyzer;
pub mod api;
pub mod config;
pub mod executor;
pub mod knowledge;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::ConfigWatcher;
use crate::executor::EnforcementBackend;
use crate::knowledge::KnowledgeBase;
use crate::metrics::HealMetrics;
use crate::monitor::{AlertInbox, TelemetrySource};
use crate::orchestrator::{LoopControl, Orchestrator};
use crate::storage::ExecutionLog;

/// Start the control loop and, when enabled, the API server. Returns once
/// `control` has stopped the loop.
pub async fn serve(
    watcher: ConfigWatcher,
    telemetry: Arc<dyn TelemetrySource>,
    backend: Arc<dyn EnforcementBackend>,
    alerts: Option<AlertInbox>,
    control: LoopControl,
) -> Result<()> {
    let config = watcher.current();

    // 1. Storage and knowledge
    tracing::info!(db_path = %config.knowledge.db_path.display(), "initializing database");
    let pool = storage::open_pool(&config.knowledge.db_path)?;
    let (knowledge, writer) = KnowledgeBase::open(pool.clone(), &config.knowledge).await?;
    let executions = ExecutionLog::new(pool);

    let metrics = HealMetrics::new().context("failed to register metrics")?;
    metrics.update_confidence(&knowledge.snapshot());

    // 2. Control loop (background task)
    let mut orchestrator = Orchestrator::new(
        watcher,
        telemetry,
        backend,
        knowledge.clone(),
        executions.clone(),
        metrics.clone(),
    );
    if let Some(inbox) = alerts {
        orchestrator = orchestrator.with_alerts(inbox);
    }
    let state = api::state::AppState {
        status: orchestrator.status(),
        knowledge,
        executions,
        approvals: orchestrator.approvals(),
        metrics,
    };
    let loop_task = tokio::spawn(orchestrator.run(control.clone()));

    // 3. API server
    let served = if config.api.enabled {
        serve_api(&config.api.bind, api::router(state), &control).await
    } else {
        drop(state);
        Ok(())
    };
    if let Err(e) = served {
        // The loop never outlives a failed API server.
        tracing::error!(error = %format!("{e:#}"), "api server failed, stopping control loop");
        control.cancel();
        if let Err(join) = loop_task.await {
            tracing::error!(error = %join, "control loop panicked");
        }
        return Err(e);
    }

    loop_task.await.context("control loop panicked")?;
    // The writer exits once the last handle is gone.
    writer.await.context("knowledge writer panicked")?;
    Ok(())
}

async fn serve_api(bind: &str, router: axum::Router, control: &LoopControl) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid api.bind address: {bind}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "autoheal listening");

    let stop = control.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { stop.shutdown_token().cancelled().await })
        .await
        .context("api server failed")
}
