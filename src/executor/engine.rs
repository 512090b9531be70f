//! The execution engine: ordered steps, bounded verification and
//! reverse-order compensation.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::guard::{DenyReason, ExecutionGuard};
use super::locks::ComponentLocks;
use super::{
    ActionStatus, CharterRequest, CharterStatus, EnforcementBackend, EnforcementError,
    ExecutionStatus, PolicyExecution, RollbackOutcome, StepFailure, StepRecord,
};
use crate::config::ExecutorConfig;
use crate::planner::{Compensation, RemediationPolicy};
use crate::retry::{self, RetryError, Transient};

/// Why a policy was not run this time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    RateLimited,
    CircuitOpen,
    Cancelled,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferReason::RateLimited => "rate_limited",
            DeferReason::CircuitOpen => "circuit_open",
            DeferReason::Cancelled => "cancelled",
        }
    }
}

impl From<DenyReason> for DeferReason {
    fn from(r: DenyReason) -> Self {
        match r {
            DenyReason::RateLimited => DeferReason::RateLimited,
            DenyReason::CircuitOpen => DeferReason::CircuitOpen,
        }
    }
}

/// A policy that never reached RUNNING.
#[derive(Debug, Clone)]
pub struct Deferred {
    pub policy: RemediationPolicy,
    pub reason: DeferReason,
}

/// What a spawned execution task reports back.
#[derive(Debug, Clone)]
pub enum ExecutionReport {
    Finished(PolicyExecution),
    Deferred(Deferred),
}

/// Runs remediation policies against the enforcement backend.
///
/// Cheap to clone; clones share locks, guards and the worker pool.
#[derive(Clone)]
pub struct Executor {
    config: Arc<RwLock<ExecutorConfig>>,
    backend: Arc<dyn EnforcementBackend>,
    locks: ComponentLocks,
    workers: Arc<RwLock<Arc<Semaphore>>>,
    guard: Arc<ExecutionGuard>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, backend: Arc<dyn EnforcementBackend>) -> Self {
        let guard = ExecutionGuard::new(config.rate_limit.clone(), config.circuit_breaker.clone());
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config: Arc::new(RwLock::new(config)),
            backend,
            locks: ComponentLocks::new(),
            workers: Arc::new(RwLock::new(workers)),
            guard: Arc::new(guard),
        }
    }

    /// Apply new settings. In-flight executions keep the pool they started
    /// with; a changed worker count takes effect for new ones.
    pub async fn reconfigure(&self, config: ExecutorConfig) {
        self.guard
            .reconfigure(config.rate_limit.clone(), config.circuit_breaker.clone())
            .await;
        let mut current = self.config.write().await;
        if current.workers != config.workers {
            *self.workers.write().await = Arc::new(Semaphore::new(config.workers.max(1)));
        }
        *current = config;
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn locks(&self) -> &ComponentLocks {
        &self.locks
    }

    /// Run every policy on its own task. Each result is sent on `tx` as
    /// soon as it is known, so the receiver sees completion order.
    pub fn spawn_all(
        &self,
        policies: Vec<RemediationPolicy>,
        cycle: u64,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<ExecutionReport>,
    ) -> Vec<JoinHandle<()>> {
        policies
            .into_iter()
            .map(|policy| {
                let executor = self.clone();
                let cancel = cancel.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let report = match executor.execute(policy, cycle, &cancel).await {
                        Ok(exec) => ExecutionReport::Finished(exec),
                        Err(deferred) => ExecutionReport::Deferred(deferred),
                    };
                    if tx.send(report).is_err() {
                        debug!("execution report receiver dropped");
                    }
                })
            })
            .collect()
    }

    /// Run one policy to a terminal state.
    ///
    /// `Err` means the policy never started: it was cancelled while waiting
    /// for a worker or its component, or the guard refused it.
    pub async fn execute(
        &self,
        policy: RemediationPolicy,
        cycle: u64,
        cancel: &CancellationToken,
    ) -> Result<PolicyExecution, Deferred> {
        let defer = |policy: RemediationPolicy, reason: DeferReason| Deferred { policy, reason };

        let workers = Arc::clone(&*self.workers.read().await);
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(defer(policy, DeferReason::Cancelled)),
            permit = workers.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return Err(defer(policy, DeferReason::Cancelled)),
            },
        };
        let component = policy.component.clone();
        let _component = tokio::select! {
            _ = cancel.cancelled() => return Err(defer(policy, DeferReason::Cancelled)),
            guard = self.locks.lock(&component) => guard,
        };
        if let Err(reason) = self.guard.admit().await {
            info!(
                policy_id = %policy.id,
                component = %policy.component,
                reason = %reason,
                "policy deferred"
            );
            return Err(defer(policy, reason.into()));
        }

        let config = self.config.read().await.clone();
        let mut exec = PolicyExecution::from_policy(&policy, cycle);
        self.run(&mut exec, &config, cancel).await;
        Ok(exec)
    }

    async fn run(&self, exec: &mut PolicyExecution, config: &ExecutorConfig, cancel: &CancellationToken) {
        if let Err(e) = exec.transition(ExecutionStatus::Running) {
            error!(execution_id = %exec.id, error = %e, "execution could not start");
            return;
        }
        info!(
            execution_id = %exec.id,
            policy_id = %exec.policy_id,
            component = %exec.component,
            root_cause = %exec.root_cause,
            steps = exec.steps.len(),
            "execution started"
        );

        let mut failed_at = None;
        for i in 0..exec.steps.len() {
            if cancel.is_cancelled() {
                let step = &mut exec.steps[i];
                step.status = ActionStatus::Skipped;
                step.failure = Some(StepFailure::Cancelled);
                failed_at = Some(i);
                break;
            }
            let (execution_id, policy_id) = (exec.id, exec.policy_id);
            if let Err(failure) = self
                .run_step(execution_id, policy_id, &mut exec.steps[i], config, cancel)
                .await
            {
                warn!(
                    execution_id = %exec.id,
                    step = i,
                    action = %exec.steps[i].action,
                    failure = %failure,
                    "step failed"
                );
                let step = &mut exec.steps[i];
                step.status = ActionStatus::Failed;
                step.failure = Some(failure);
                step.finished_at = Some(Utc::now());
                failed_at = Some(i);
                break;
            }
        }

        let Some(failed_at) = failed_at else {
            // Only Running -> Succeeded is possible here.
            let _ = exec.transition(ExecutionStatus::Succeeded);
            info!(execution_id = %exec.id, component = %exec.component, "execution succeeded");
            return;
        };

        for step in exec.steps.iter_mut().skip(failed_at + 1) {
            step.status = ActionStatus::Skipped;
        }
        let _ = exec.transition(ExecutionStatus::Failed);

        let outcome = tokio::time::timeout(config.compensation_timeout(), self.compensate(exec, config)).await;
        let compensated = match outcome {
            Ok(all_reverted) => all_reverted,
            Err(_) => {
                error!(execution_id = %exec.id, "compensation timed out");
                for step in exec.steps.iter_mut().filter(|s| s.awaiting_compensation()) {
                    step.status = ActionStatus::CompensationFailed;
                    step.note = Some("compensation timed out".into());
                }
                false
            }
        };

        if compensated {
            let _ = exec.transition(ExecutionStatus::RolledBack);
            info!(execution_id = %exec.id, component = %exec.component, "execution rolled back");
        } else {
            exec.escalated = true;
            error!(
                execution_id = %exec.id,
                component = %exec.component,
                "compensation incomplete, operator intervention required"
            );
        }
    }

    /// Create, apply and verify one step.
    async fn run_step(
        &self,
        execution_id: Uuid,
        policy_id: Uuid,
        step: &mut StepRecord,
        config: &ExecutorConfig,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        step.started_at = Some(Utc::now());
        let request = CharterRequest {
            execution_id,
            policy_id,
            step: step.index,
            action: step.action.clone(),
            compensation: step.compensation.clone(),
        };

        let backend = &self.backend;
        let charter_id = self
            .call(config, cancel, "create_policy", || backend.create_policy(&request, cancel))
            .await?;
        step.charter_id = Some(charter_id.clone());

        self.call(config, cancel, "apply_policy", || backend.apply_policy(&charter_id, cancel))
            .await?;
        step.applied = true;
        step.status = ActionStatus::Applied;
        debug!(execution_id = %execution_id, step = step.index, charter_id = %charter_id, "step applied");

        self.verify(&charter_id, config, cancel).await?;
        step.status = ActionStatus::Succeeded;
        step.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Poll the charter until it is enforced, fails or the window closes.
    async fn verify(
        &self,
        charter_id: &str,
        config: &ExecutorConfig,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let deadline = Instant::now() + config.verify_window();
        loop {
            let status = tokio::time::timeout(
                config.action_timeout(),
                self.backend.get_policy_status(charter_id, cancel),
            )
            .await
            .unwrap_or(Err(EnforcementError::Timeout(config.action_timeout())));

            match status {
                Ok(CharterStatus::Enforced) => {
                    self.guard.record_success().await;
                    return Ok(());
                }
                Ok(CharterStatus::Failed { reason }) => return Err(StepFailure::VerificationFailed(reason)),
                Ok(CharterStatus::RolledBack) => {
                    return Err(StepFailure::VerificationFailed("charter was rolled back".into()))
                }
                Ok(CharterStatus::Pending) => {}
                Err(e) if e.is_transient() => {
                    debug!(charter_id, error = %e, "status check failed, polling again");
                }
                Err(e) => return Err(StepFailure::VerificationFailed(e.to_string())),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StepFailure::VerificationTimeout);
            }
            let pause = config.verify_poll().min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepFailure::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Undo applied steps, newest first. True when every applied step was
    /// reverted or needed no undo.
    async fn compensate(&self, exec: &mut PolicyExecution, config: &ExecutorConfig) -> bool {
        // Compensation outlives cycle cancellation.
        let token = CancellationToken::new();
        let mut all_reverted = true;

        for step in exec.steps.iter_mut().rev().filter(|s| s.applied) {
            let charter_id = match (&step.compensation, &step.charter_id) {
                (Compensation::NoOp(reason), _) => {
                    step.status = ActionStatus::Compensated;
                    step.note = Some(reason.clone());
                    continue;
                }
                (Compensation::Apply(_), Some(id)) => id.clone(),
                (Compensation::Apply(_), None) => {
                    step.status = ActionStatus::CompensationFailed;
                    step.note = Some("applied step has no charter id".into());
                    all_reverted = false;
                    continue;
                }
            };

            let backend = &self.backend;
            let outcome = self
                .call(config, &token, "rollback_policy", || {
                    backend.rollback_policy(&charter_id, &token)
                })
                .await;

            match outcome {
                Ok(RollbackOutcome::Reverted) => {
                    step.status = ActionStatus::Compensated;
                    info!(execution_id = %exec.id, step = step.index, action = %step.action, "step compensated");
                }
                Ok(RollbackOutcome::Irreversible { reason }) => {
                    warn!(execution_id = %exec.id, step = step.index, reason = %reason, "step is irreversible");
                    step.status = ActionStatus::CompensationFailed;
                    step.note = Some(reason);
                    all_reverted = false;
                }
                Err(failure) => {
                    warn!(execution_id = %exec.id, step = step.index, failure = %failure, "compensation failed");
                    step.status = ActionStatus::CompensationFailed;
                    step.note = Some(failure.to_string());
                    all_reverted = false;
                }
            }
        }
        all_reverted
    }

    /// One retried, time-bounded backend call.
    async fn call<T, F, Fut>(
        &self,
        config: &ExecutorConfig,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EnforcementError>>,
    {
        let limit = config.action_timeout();
        let result = retry::with_backoff(&config.retry, cancel, what, || {
            let fut = op();
            async move {
                tokio::time::timeout(limit, fut)
                    .await
                    .unwrap_or(Err(EnforcementError::Timeout(limit)))
            }
        })
        .await;

        match result {
            Ok(value) => {
                self.guard.record_success().await;
                Ok(value)
            }
            Err(RetryError::Exhausted { last, .. }) => {
                self.guard.record_failure().await;
                Err(StepFailure::Unreachable(last.to_string()))
            }
            Err(RetryError::Fatal(e)) => Err(StepFailure::Rejected(e.to_string())),
            Err(RetryError::Cancelled) => Err(StepFailure::Cancelled),
        }
    }
}

impl StepRecord {
    fn awaiting_compensation(&self) -> bool {
        self.applied && !matches!(self.status, ActionStatus::Compensated | ActionStatus::CompensationFailed)
    }
}
