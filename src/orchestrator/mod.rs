//! The MAPE-K cycle driver.
//!
//! One logical driver runs IDLE → MONITORING → ANALYZING → PLANNING →
//! EXECUTING → LEARNING → IDLE on a fixed interval. Every phase runs under
//! its own time budget and a per-cycle cancellation token; a phase that
//! overruns or fails abandons only the current cycle.

pub mod approvals;
pub mod engine;

pub use approvals::{ApprovalQueue, ApprovedPolicy, ParkResult, PendingApproval};
pub use engine::Orchestrator;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Monitoring,
    Analyzing,
    Planning,
    Executing,
    Learning,
}

impl CyclePhase {
    /// Phases that do work, in cycle order.
    pub const ACTIVE: [CyclePhase; 5] = [
        CyclePhase::Monitoring,
        CyclePhase::Analyzing,
        CyclePhase::Planning,
        CyclePhase::Executing,
        CyclePhase::Learning,
    ];

    /// Short name used in metric labels and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Monitoring => "monitor",
            CyclePhase::Analyzing => "analyze",
            CyclePhase::Planning => "plan",
            CyclePhase::Executing => "execute",
            CyclePhase::Learning => "learn",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cycle was abandoned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CycleError {
    #[error("{phase} phase exceeded its {limit:?} budget")]
    PhaseTimeout { phase: CyclePhase, limit: Duration },
    #[error("{phase} phase failed: {reason}")]
    PhaseFailed { phase: CyclePhase, reason: String },
    #[error("cancelled during {phase} phase")]
    Cancelled { phase: CyclePhase },
}

impl CycleError {
    pub fn phase(&self) -> CyclePhase {
        match self {
            CycleError::PhaseTimeout { phase, .. }
            | CycleError::PhaseFailed { phase, .. }
            | CycleError::Cancelled { phase } => *phase,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub violations: usize,
    pub dropped: usize,
    pub degraded: bool,
    pub hypotheses: usize,
    pub policies_planned: usize,
    pub policies_started: usize,
    pub parked_for_approval: usize,
    pub outcomes_recorded: usize,
    /// Set when the cycle was abandoned.
    pub error: Option<String>,
}

impl CycleSummary {
    pub fn completed(&self) -> bool {
        self.error.is_none()
    }
}

/// Published after every phase change.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub phase: CyclePhase,
    pub cycle: u64,
    pub running: bool,
    pub degraded: bool,
    pub pending_approvals: usize,
    pub last_cycle: Option<CycleSummary>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycle: 0,
            running: false,
            degraded: false,
            pending_approvals: 0,
            last_cycle: None,
        }
    }
}

/// Stop signals for a running loop.
///
/// `shutdown` lets the in-flight cycle finish; `cancel` additionally aborts
/// its outstanding I/O. Executions that already reached the backend still
/// compensate.
#[derive(Clone, Default)]
pub struct LoopControl {
    shutdown: CancellationToken,
    cancel: CancellationToken,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn cancel(&self) {
        self.shutdown.cancel();
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
