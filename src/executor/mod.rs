//! Transactional policy execution.
//!
//! Actions of a policy run strictly in order against an
//! [`EnforcementBackend`]. Each applied action is verified within a bounded
//! window; the first failure compensates every applied action in reverse
//! order. Executions on one component never overlap.

pub mod engine;
pub mod guard;
pub mod locks;

pub use engine::{DeferReason, Deferred, ExecutionReport, Executor};
pub use guard::{BreakerState, ExecutionGuard};
pub use locks::ComponentLocks;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::RootCause;
use crate::planner::{Action, ActionKind, Compensation, RemediationPolicy};
use crate::retry::Transient;

// ---------------------------------------------------------------------------
// Enforcement backend contract
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnforcementError {
    #[error("enforcement backend unreachable: {0}")]
    Unreachable(String),
    #[error("enforcement call timed out after {0:?}")]
    Timeout(Duration),
    #[error("enforcement backend rejected the request: {0}")]
    Rejected(String),
    #[error("unknown charter `{0}`")]
    NotFound(String),
}

impl Transient for EnforcementError {
    fn is_transient(&self) -> bool {
        matches!(self, EnforcementError::Unreachable(_) | EnforcementError::Timeout(_))
    }
}

/// What the backend is asked to enforce for one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharterRequest {
    pub execution_id: Uuid,
    pub policy_id: Uuid,
    pub step: usize,
    pub action: Action,
    pub compensation: Compensation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharterStatus {
    Pending,
    Enforced,
    Failed { reason: String },
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    Reverted,
    /// The backend cannot undo this charter; a human has to.
    Irreversible { reason: String },
}

/// The policy-enforcement backend.
///
/// `apply_policy` must be idempotent for a given charter id; it is retried.
#[async_trait::async_trait]
pub trait EnforcementBackend: Send + Sync {
    async fn create_policy(
        &self,
        request: &CharterRequest,
        cancel: &CancellationToken,
    ) -> Result<String, EnforcementError>;

    async fn apply_policy(&self, charter_id: &str, cancel: &CancellationToken) -> Result<(), EnforcementError>;

    async fn rollback_policy(
        &self,
        charter_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RollbackOutcome, EnforcementError>;

    async fn get_policy_status(
        &self,
        charter_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CharterStatus, EnforcementError>;
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::RolledBack
        )
    }

    fn can_become(self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Succeeded) | (Running, Failed) | (Failed, RolledBack)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("illegal execution transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    /// Applied, not yet verified.
    Applied,
    Succeeded,
    Failed,
    Compensated,
    CompensationFailed,
    /// Never attempted because an earlier step failed.
    Skipped,
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepFailure {
    Rejected(String),
    Unreachable(String),
    VerificationFailed(String),
    VerificationTimeout,
    Cancelled,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Rejected(r) => write!(f, "rejected: {r}"),
            StepFailure::Unreachable(r) => write!(f, "backend unreachable: {r}"),
            StepFailure::VerificationFailed(r) => write!(f, "verification failed: {r}"),
            StepFailure::VerificationTimeout => f.write_str("verification timed out"),
            StepFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: Action,
    pub compensation: Compensation,
    pub charter_id: Option<String>,
    pub status: ActionStatus,
    /// `apply_policy` returned Ok; the step must be compensated on failure.
    pub applied: bool,
    pub failure: Option<StepFailure>,
    pub note: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The record of one policy run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyExecution {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub component: String,
    pub root_cause: RootCause,
    pub primary_action: ActionKind,
    pub steps: Vec<StepRecord>,
    pub status: ExecutionStatus,
    /// Compensation could not be completed; operators were needed.
    pub escalated: bool,
    /// Cycle that started the execution.
    pub cycle: u64,
    /// Signals breaching on the target when the policy was planned.
    pub signals: Vec<String>,
    /// First contributing violation, the start of the MTTR clock.
    pub detected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PolicyExecution {
    pub fn new(policy_id: Uuid, component: &str, root_cause: RootCause, primary_action: ActionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_id,
            component: component.to_string(),
            root_cause,
            primary_action,
            steps: Vec::new(),
            status: ExecutionStatus::Pending,
            escalated: false,
            cycle: 0,
            signals: Vec::new(),
            detected_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn from_policy(policy: &RemediationPolicy, cycle: u64) -> Self {
        let mut exec = Self::new(
            policy.id,
            &policy.component,
            policy.root_cause,
            policy.primary_action(),
        );
        exec.cycle = cycle;
        exec.signals = policy.signals.clone();
        exec.detected_at = Some(policy.detected_at);
        exec.steps = policy
            .actions
            .iter()
            .enumerate()
            .map(|(index, planned)| StepRecord {
                index,
                action: planned.action.clone(),
                compensation: planned.compensation.clone(),
                charter_id: None,
                status: ActionStatus::Pending,
                applied: false,
                failure: None,
                note: None,
                started_at: None,
                finished_at: None,
            })
            .collect();
        exec
    }

    /// Move to `to`, refusing anything but the forward edges of the state
    /// machine.
    pub fn transition(&mut self, to: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_become(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        match to {
            ExecutionStatus::Running => self.started_at = Some(now),
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::RolledBack => {
                self.finished_at = Some(now)
            }
            ExecutionStatus::Pending => {}
        }
        self.status = to;
        Ok(())
    }

    /// First step failure, if any.
    pub fn failure(&self) -> Option<&StepFailure> {
        self.steps.iter().find_map(|s| s.failure.as_ref())
    }

    /// Seconds from first detection to the terminal state.
    pub fn mttr_sec(&self) -> Option<f64> {
        let start = self.detected_at?;
        let end = self.finished_at?;
        Some(((end - start).num_milliseconds().max(0) as f64) / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> PolicyExecution {
        PolicyExecution::new(Uuid::new_v4(), "web-1", RootCause::ResourceExhaustion, ActionKind::ScaleOut)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut e = exec();
        e.transition(ExecutionStatus::Running).unwrap();
        assert!(e.started_at.is_some());
        e.transition(ExecutionStatus::Succeeded).unwrap();
        assert!(e.finished_at.is_some());
        assert!(e.status.is_terminal());
    }

    #[test]
    fn test_rollback_path() {
        let mut e = exec();
        e.transition(ExecutionStatus::Running).unwrap();
        e.transition(ExecutionStatus::Failed).unwrap();
        e.transition(ExecutionStatus::RolledBack).unwrap();
        assert_eq!(e.status, ExecutionStatus::RolledBack);
    }

    #[test]
    fn test_terminal_states_never_run_again() {
        for terminal in [ExecutionStatus::Succeeded, ExecutionStatus::Failed, ExecutionStatus::RolledBack] {
            let mut e = exec();
            e.status = terminal;
            assert_eq!(
                e.transition(ExecutionStatus::Running),
                Err(TransitionError {
                    from: terminal,
                    to: ExecutionStatus::Running
                })
            );
        }

        let mut e = exec();
        assert!(e.transition(ExecutionStatus::Succeeded).is_err());
        e.transition(ExecutionStatus::Running).unwrap();
        e.transition(ExecutionStatus::Succeeded).unwrap();
        assert!(e.transition(ExecutionStatus::RolledBack).is_err());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::RolledBack).unwrap(),
            "\"ROLLED_BACK\""
        );
        assert!(EnforcementError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!EnforcementError::Rejected("no".into()).is_transient());
    }

    #[test]
    fn test_mttr() {
        let mut e = exec();
        let now = Utc::now();
        e.detected_at = Some(now - chrono::Duration::seconds(90));
        e.finished_at = Some(now);
        assert_eq!(e.mttr_sec(), Some(90.0));
    }
}
