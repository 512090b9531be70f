//! Outcome history and learned remediation efficacy.
//!
//! Every finished execution appends one [`PolicyOutcome`] to an immutable
//! log. Per (root cause, action) aggregates are derived from that log and
//! owned by a single writer task ([`base::KnowledgeBase`]); everyone else
//! reads the last committed [`KnowledgeSnapshot`] through a
//! [`KnowledgeHandle`]. The same writer keeps the per-signal threshold
//! factors tuned by recovery feedback and the replica counts left behind by
//! successful scaling.

pub mod base;
pub mod store;

pub use base::{KnowledgeBase, KnowledgeHandle, RecordStatus};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::analyzer::RootCause;
use crate::config::ThresholdTuning;
use crate::executor::PolicyExecution;
use crate::planner::ActionKind;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("knowledge base storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("knowledge base writer has stopped")]
    Closed,
    #[error("unknown outcome `{0}`")]
    UnknownOutcome(String),
}

/// Empirical success ratio, or `Unknown` while there is too little (or
/// untrustworthy) data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Confidence {
    Known(f64),
    Unknown,
}

impl Confidence {
    pub fn value(self) -> Option<f64> {
        match self {
            Confidence::Known(v) => Some(v),
            Confidence::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Confidence::Known(_))
    }
}

/// How an execution ended, as judged after remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The violations cleared.
    Success,
    /// The violations were reduced.
    Partial,
    Failure,
    RolledBack,
    /// The execution succeeded but nothing measurably changed.
    NoOp,
    /// The execution succeeded but its effect could not be measured.
    Unverified,
}

impl Outcome {
    pub const ALL: [Outcome; 6] = [
        Outcome::Success,
        Outcome::Partial,
        Outcome::Failure,
        Outcome::RolledBack,
        Outcome::NoOp,
        Outcome::Unverified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failure => "failure",
            Outcome::RolledBack => "rolled_back",
            Outcome::NoOp => "no_op",
            Outcome::Unverified => "unverified",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Outcome::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| KnowledgeError::UnknownOutcome(s.to_string()))
    }
}

/// One immutable entry of the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub execution_id: Uuid,
    pub policy_id: Uuid,
    pub component: String,
    pub root_cause: RootCause,
    /// The policy's primary action; aggregates are keyed by it.
    pub action: ActionKind,
    pub outcome: Outcome,
    /// Breaching signals before minus after remediation.
    pub metric_delta: Option<f64>,
    /// Seconds from the first contributing violation to the terminal state.
    pub mttr_sec: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl PolicyOutcome {
    pub fn from_execution(
        execution: &PolicyExecution,
        outcome: Outcome,
        metric_delta: Option<f64>,
        mttr_sec: Option<f64>,
    ) -> Self {
        Self {
            execution_id: execution.id,
            policy_id: execution.policy_id,
            component: execution.component.clone(),
            root_cause: execution.root_cause,
            action: execution.primary_action,
            outcome,
            metric_delta,
            mttr_sec,
            recorded_at: Utc::now(),
        }
    }
}

/// Which way a recorded outcome moves the thresholds of the signals that
/// triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdFeedback {
    /// Detect earlier next time.
    Tighten,
    Relax,
    Hold,
}

impl ThresholdFeedback {
    /// No-op and unverified outcomes say nothing about detection timing.
    pub fn from_outcome(outcome: Outcome, mttr_sec: Option<f64>, tuning: &ThresholdTuning) -> Self {
        match outcome {
            Outcome::Failure | Outcome::RolledBack => ThresholdFeedback::Tighten,
            Outcome::NoOp | Outcome::Unverified => ThresholdFeedback::Hold,
            Outcome::Success | Outcome::Partial => match mttr_sec {
                Some(mttr) if mttr > tuning.slow_mttr_sec => ThresholdFeedback::Tighten,
                Some(mttr) if outcome == Outcome::Success && mttr <= tuning.fast_mttr_sec => {
                    ThresholdFeedback::Relax
                }
                _ => ThresholdFeedback::Hold,
            },
        }
    }

    /// The next factor, kept inside the configured bounds.
    pub fn apply(self, factor: f64, tuning: &ThresholdTuning) -> f64 {
        let next = match self {
            ThresholdFeedback::Tighten => factor * (1.0 - tuning.tighten_step),
            ThresholdFeedback::Relax => factor * (1.0 + tuning.relax_step),
            ThresholdFeedback::Hold => factor,
        };
        next.clamp(tuning.min_factor, tuning.max_factor)
    }
}

/// Aggregate counts for one (root cause, action) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub rollback_count: u64,
    pub noop_count: u64,
    /// Persisted aggregates disagreed with the log; fail closed until reset.
    pub corrupted: bool,
}

impl PairStats {
    pub fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success | Outcome::Partial => self.success_count += 1,
            Outcome::Failure => self.failure_count += 1,
            Outcome::RolledBack => self.rollback_count += 1,
            Outcome::NoOp => self.noop_count += 1,
            Outcome::Unverified => {}
        }
    }

    /// Outcomes that count towards action confidence.
    pub fn sample_size(&self) -> u64 {
        self.success_count + self.failure_count + self.rollback_count
    }

    pub fn same_counts(&self, other: &PairStats) -> bool {
        self.success_count == other.success_count
            && self.failure_count == other.failure_count
            && self.rollback_count == other.rollback_count
            && self.noop_count == other.noop_count
    }

    pub fn confidence(&self, min_sample_size: u64) -> Confidence {
        let n = self.sample_size();
        if self.corrupted || n == 0 || n < min_sample_size {
            return Confidence::Unknown;
        }
        Confidence::Known((self.success_count as f64 / n as f64).clamp(0.0, 1.0))
    }
}

/// Read-only view of one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningInsight {
    pub root_cause_type: RootCause,
    pub action_type: ActionKind,
    pub success_count: u64,
    pub failure_count: u64,
    pub rollback_count: u64,
    pub confidence: Confidence,
    pub sample_size: u64,
}

/// Last committed state of the aggregate table.
#[derive(Debug, Clone)]
pub struct KnowledgeSnapshot {
    pairs: BTreeMap<(RootCause, ActionKind), PairStats>,
    /// Per-signal threshold factors; absent means 1.0.
    thresholds: BTreeMap<String, f64>,
    /// Replica counts observed after successful scaling.
    replicas: BTreeMap<String, u32>,
    min_sample_size: u64,
    /// Bumped on every committed change.
    pub version: u64,
}

impl Default for KnowledgeSnapshot {
    fn default() -> Self {
        Self::with_min_sample_size(5)
    }
}

impl KnowledgeSnapshot {
    pub fn with_min_sample_size(min_sample_size: u64) -> Self {
        Self {
            pairs: BTreeMap::new(),
            thresholds: BTreeMap::new(),
            replicas: BTreeMap::new(),
            min_sample_size: min_sample_size.max(1),
            version: 0,
        }
    }

    pub(crate) fn from_parts(
        pairs: BTreeMap<(RootCause, ActionKind), PairStats>,
        thresholds: BTreeMap<String, f64>,
        replicas: BTreeMap<String, u32>,
        min_sample_size: u64,
        version: u64,
    ) -> Self {
        Self {
            pairs,
            thresholds,
            replicas,
            min_sample_size: min_sample_size.max(1),
            version,
        }
    }

    pub fn insert(&mut self, root_cause: RootCause, action: ActionKind, stats: PairStats) {
        self.pairs.insert((root_cause, action), stats);
    }

    pub fn set_threshold_factor(&mut self, signal: &str, factor: f64) {
        self.thresholds.insert(signal.to_string(), factor);
    }

    pub fn set_replicas(&mut self, component: &str, replicas: u32) {
        self.replicas.insert(component.to_string(), replicas);
    }

    pub fn threshold_factor(&self, signal: &str) -> f64 {
        self.thresholds.get(signal).copied().unwrap_or(1.0)
    }

    pub fn threshold_factors(&self) -> &BTreeMap<String, f64> {
        &self.thresholds
    }

    /// Last replica count a successful scale action left `component` at.
    pub fn replicas(&self, component: &str) -> Option<u32> {
        self.replicas.get(component).copied()
    }

    pub fn min_sample_size(&self) -> u64 {
        self.min_sample_size
    }

    pub fn stats(&self, root_cause: RootCause, action: ActionKind) -> Option<&PairStats> {
        self.pairs.get(&(root_cause, action))
    }

    pub fn confidence(&self, root_cause: RootCause, action: ActionKind) -> Confidence {
        self.stats(root_cause, action)
            .map_or(Confidence::Unknown, |s| s.confidence(self.min_sample_size))
    }

    /// How often diagnosing `root_cause` led to a fix, whatever the action.
    ///
    /// No-op outcomes count against the diagnosis. Corrupted pairs are left
    /// out.
    pub fn hypothesis_accuracy(&self, root_cause: RootCause) -> Confidence {
        let (hits, total) = self
            .pairs
            .iter()
            .filter(|((rc, _), s)| *rc == root_cause && !s.corrupted)
            .fold((0u64, 0u64), |(hits, total), (_, s)| {
                (hits + s.success_count, total + s.sample_size() + s.noop_count)
            });
        if total == 0 || total < self.min_sample_size {
            return Confidence::Unknown;
        }
        Confidence::Known((hits as f64 / total as f64).clamp(0.0, 1.0))
    }

    /// Action with the highest known confidence for `root_cause`.
    pub fn best_action(&self, root_cause: RootCause) -> Option<(ActionKind, f64)> {
        self.pairs
            .iter()
            .filter(|((rc, _), _)| *rc == root_cause)
            .filter_map(|((_, action), s)| {
                s.confidence(self.min_sample_size).value().map(|c| (*action, c))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Best action for `root_cause` and its confidence. Falls back to the
    /// most exercised action (with unknown confidence) when nothing is
    /// known yet.
    pub fn query(&self, root_cause: RootCause) -> Option<(ActionKind, Confidence)> {
        if let Some((action, c)) = self.best_action(root_cause) {
            return Some((action, Confidence::Known(c)));
        }
        self.pairs
            .iter()
            .filter(|((rc, _), _)| *rc == root_cause)
            .max_by_key(|(_, s)| s.sample_size() + s.noop_count)
            .map(|((_, action), _)| (*action, Confidence::Unknown))
    }

    pub fn insights(&self) -> Vec<LearningInsight> {
        self.pairs
            .iter()
            .map(|(&(root_cause, action), s)| LearningInsight {
                root_cause_type: root_cause,
                action_type: action,
                success_count: s.success_count,
                failure_count: s.failure_count,
                rollback_count: s.rollback_count,
                confidence: s.confidence(self.min_sample_size),
                sample_size: s.sample_size(),
            })
            .collect()
    }
}
