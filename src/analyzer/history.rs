use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::RootCause;
use crate::monitor::Violation;

struct CycleViolations {
    cycle: u64,
    violations: Vec<Violation>,
}

/// Violations of recent cycles plus the ineffective-remediation ledger.
///
/// Owned by the orchestrator and handed to the analyzer read-only.
pub struct AnalysisHistory {
    cycles: VecDeque<CycleViolations>,
    capacity: usize,
    ineffective: HashMap<(RootCause, String), u64>,
}

impl AnalysisHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            cycles: VecDeque::new(),
            capacity: capacity.max(1),
            ineffective: HashMap::new(),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.trim();
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Remember what `cycle` observed. Quiet cycles must be pushed too; they
    /// are the zeroes of the frequency baseline.
    pub fn push_cycle(&mut self, cycle: u64, violations: Vec<Violation>) {
        self.cycles.push_back(CycleViolations { cycle, violations });
        self.trim();
    }

    fn trim(&mut self) {
        while self.cycles.len() > self.capacity {
            self.cycles.pop_front();
        }
    }

    /// Stored violations with a timestamp at or after `since`.
    pub fn violations_since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &Violation> {
        self.cycles
            .iter()
            .flat_map(|c| c.violations.iter())
            .filter(move |v| v.timestamp >= since)
    }

    /// Violation counts of `component` in the last `cycles` stored cycles,
    /// oldest first.
    pub fn counts_for(&self, component: &str, cycles: usize) -> Vec<f64> {
        let skip = self.cycles.len().saturating_sub(cycles);
        self.cycles
            .iter()
            .skip(skip)
            .map(|c| c.violations.iter().filter(|v| v.component == component).count() as f64)
            .collect()
    }

    /// Every component seen in stored cycles.
    pub fn components(&self) -> HashSet<&str> {
        self.cycles
            .iter()
            .flat_map(|c| c.violations.iter().map(|v| v.component.as_str()))
            .collect()
    }

    pub fn last_cycle(&self) -> Option<u64> {
        self.cycles.back().map(|c| c.cycle)
    }

    /// A remediation for `(root_cause, component)` made no measurable
    /// difference in `cycle`.
    pub fn mark_ineffective(&mut self, root_cause: RootCause, component: &str, cycle: u64) {
        self.ineffective
            .insert((root_cause, component.to_string()), cycle);
    }

    /// Whether the pair was marked ineffective within the last `within`
    /// cycles before `cycle`.
    pub fn is_suppressed(&self, root_cause: RootCause, component: &str, cycle: u64, within: u64) -> bool {
        self.ineffective
            .get(&(root_cause, component.to_string()))
            .is_some_and(|&marked| cycle.saturating_sub(marked) <= within)
    }

    /// Forget ledger entries older than `within` cycles.
    pub fn expire_ledger(&mut self, cycle: u64, within: u64) {
        self.ineffective
            .retain(|_, marked| cycle.saturating_sub(*marked) <= within);
    }
}
