//! Pattern detection and root-cause diagnosis.
//!
//! Four detectors look at the current violations together with recent
//! history: temporal bursts, spatial co-location, causal (lagged) correlation
//! across components and frequency anomalies against a rolling baseline.
//! Every pattern maps onto a fixed root-cause taxonomy; patterns sharing a
//! root cause merge into one hypothesis whose confidence blends pattern
//! strength with how often that diagnosis led to a fix before.

pub mod causal;
pub mod frequency;
pub mod history;
pub mod spatial;
pub mod stats;
pub mod temporal;

pub use history::AnalysisHistory;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AnalyzerConfig;
use crate::knowledge::KnowledgeSnapshot;
use crate::monitor::{Severity, Violation};

#[derive(Debug, Error, PartialEq)]
pub enum AnalyzeError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },
    #[error("unknown root cause `{0}`")]
    UnknownRootCause(String),
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// What kind of quantity a signal measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalCategory {
    Resource,
    Network,
    Latency,
    Error,
    Config,
    Dependency,
    Other,
}

impl SignalCategory {
    /// Best guess from the signal name.
    pub fn infer(signal: &str) -> Self {
        let name = signal.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| name.contains(n));

        if has(&["config", "drift", "revision", "version"]) {
            SignalCategory::Config
        } else if has(&["upstream", "downstream", "dependency", "external", "third_party"]) {
            SignalCategory::Dependency
        } else if has(&["latency", "rtt", "duration", "response_time", "p99", "p95", "slow"]) {
            SignalCategory::Latency
        } else if has(&["loss", "packet", "network", "partition", "unreachable", "dns", "tcp", "conn"]) {
            SignalCategory::Network
        } else if has(&["error", "5xx", "fail", "exception", "crash"]) {
            SignalCategory::Error
        } else if has(&["cpu", "mem", "disk", "load", "heap", "swap", "thread", "fd", "queue", "oom"]) {
            SignalCategory::Resource
        } else {
            SignalCategory::Other
        }
    }

    pub fn root_cause(self) -> RootCause {
        match self {
            SignalCategory::Resource => RootCause::ResourceExhaustion,
            SignalCategory::Network | SignalCategory::Latency => RootCause::NetworkPartition,
            SignalCategory::Config => RootCause::ConfigurationDrift,
            SignalCategory::Dependency | SignalCategory::Error => {
                RootCause::ExternalDependencyFailure
            }
            SignalCategory::Other => RootCause::Unknown,
        }
    }
}

/// Diagnosed failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootCause {
    ResourceExhaustion,
    NetworkPartition,
    CascadingFailure,
    ConfigurationDrift,
    ExternalDependencyFailure,
    Unknown,
}

impl RootCause {
    pub const ALL: [RootCause; 6] = [
        RootCause::ResourceExhaustion,
        RootCause::NetworkPartition,
        RootCause::CascadingFailure,
        RootCause::ConfigurationDrift,
        RootCause::ExternalDependencyFailure,
        RootCause::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RootCause::ResourceExhaustion => "resource-exhaustion",
            RootCause::NetworkPartition => "network-partition",
            RootCause::CascadingFailure => "cascading-failure",
            RootCause::ConfigurationDrift => "configuration-drift",
            RootCause::ExternalDependencyFailure => "external-dependency-failure",
            RootCause::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RootCause {
    type Err = AnalyzeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RootCause::ALL
            .into_iter()
            .find(|rc| rc.as_str() == s)
            .ok_or_else(|| AnalyzeError::UnknownRootCause(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Temporal,
    Spatial,
    Causal,
    Frequency,
}

// ---------------------------------------------------------------------------
// Detector output and result types
// ---------------------------------------------------------------------------

/// One detector hit.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub kind: PatternKind,
    pub root_cause: RootCause,
    /// Component the pattern is centred on.
    pub component: String,
    pub affected: Vec<String>,
    /// Detector-specific strength in [0, 1].
    pub strength: f64,
    pub violations: Vec<Violation>,
    /// Timestamp of the earliest contributing violation.
    pub detected_at: DateTime<Utc>,
}

impl Pattern {
    pub(crate) fn new(
        kind: PatternKind,
        root_cause: RootCause,
        component: &str,
        strength: f64,
        violations: Vec<Violation>,
    ) -> Option<Self> {
        let detected_at = violations.iter().map(|v| v.timestamp).min()?;
        let mut affected: Vec<String> = violations.iter().map(|v| v.component.clone()).collect();
        affected.sort();
        affected.dedup();
        Some(Self {
            kind,
            root_cause,
            component: component.to_string(),
            affected,
            strength: strength.clamp(0.0, 1.0),
            violations,
            detected_at,
        })
    }
}

/// A diagnosed root cause with its supporting evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseHypothesis {
    pub root_cause: RootCause,
    /// Component remediation should target.
    pub component: String,
    /// Every component with contributing violations, `component` first.
    pub affected_components: Vec<String>,
    pub confidence: f64,
    /// Strongest pattern behind this hypothesis.
    pub pattern: PatternKind,
    pub patterns: Vec<PatternKind>,
    pub strength: f64,
    pub historical_accuracy: Option<f64>,
    pub suppressed: bool,
    pub violations: Vec<Violation>,
    pub detected_at: DateTime<Utc>,
}

impl RootCauseHypothesis {
    /// Share of contributing violations that are CRITICAL.
    pub fn critical_fraction(&self) -> f64 {
        if self.violations.is_empty() {
            return 0.0;
        }
        let critical = self
            .violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .count();
        critical as f64 / self.violations.len() as f64
    }

    /// Signals that contributed on `component`.
    pub fn signals_on(&self, component: &str) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .violations
            .iter()
            .filter(|v| v.component == component)
            .map(|v| v.signal.as_str())
            .collect();
        set.into_iter().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Ranked, at most one per root cause.
    pub hypotheses: Vec<RootCauseHypothesis>,
    pub recommendations: Vec<String>,
}

impl AnalysisResult {
    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn reconfigure(&mut self, config: AnalyzerConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Diagnose this cycle's violations.
    ///
    /// `history` must not yet contain `violations`; the orchestrator pushes
    /// them after analysis. Patterns are only reported when at least one
    /// current violation takes part.
    pub fn analyze(
        &self,
        cycle: u64,
        violations: &[Violation],
        history: &AnalysisHistory,
        knowledge: &KnowledgeSnapshot,
        now: DateTime<Utc>,
    ) -> AnalysisResult {
        if violations.is_empty() {
            return AnalysisResult::default();
        }

        let cfg = &self.config;
        let horizon = now - Duration::seconds(cfg.window_sec.max(cfg.causal_window_sec) as i64);
        let pool = dedup_pool(history.violations_since(horizon).chain(violations.iter()));

        let window_start = now - Duration::seconds(cfg.window_sec as i64);
        let windowed: Vec<Violation> = pool
            .iter()
            .filter(|v| v.timestamp >= window_start)
            .cloned()
            .collect();

        let mut patterns = Vec::new();
        patterns.extend(temporal::detect(&windowed, violations, cfg));
        patterns.extend(spatial::detect(&windowed, violations, cfg));
        patterns.extend(causal::detect(&pool, violations, cfg, now));
        patterns.extend(frequency::detect(history, violations, cfg));

        debug!(cycle, patterns = patterns.len(), "detectors finished");

        let mut hypotheses = merge_patterns(patterns);
        for h in &mut hypotheses {
            self.score(h, cycle, history, knowledge);
        }
        rank(&mut hypotheses);

        let recommendations = hypotheses
            .iter()
            .map(|h| recommend(h, knowledge))
            .collect();

        if !hypotheses.is_empty() {
            info!(
                cycle,
                hypotheses = hypotheses.len(),
                top = %hypotheses[0].root_cause,
                confidence = hypotheses[0].confidence,
                "analysis complete"
            );
        }

        AnalysisResult {
            hypotheses,
            recommendations,
        }
    }

    fn score(
        &self,
        h: &mut RootCauseHypothesis,
        cycle: u64,
        history: &AnalysisHistory,
        knowledge: &KnowledgeSnapshot,
    ) {
        let cfg = &self.config;
        h.historical_accuracy = knowledge.hypothesis_accuracy(h.root_cause).value();

        let mut confidence = match h.historical_accuracy {
            Some(acc) => (1.0 - cfg.history_weight) * h.strength + cfg.history_weight * acc,
            None => h.strength,
        };

        h.suppressed =
            history.is_suppressed(h.root_cause, &h.component, cycle, cfg.suppression_cycles);
        if h.suppressed {
            debug!(
                root_cause = %h.root_cause,
                component = %h.component,
                "recent remediation had no effect, decaying confidence"
            );
            confidence *= cfg.suppression_decay;
        }

        h.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
}

/// Remove repeat observations, e.g. overlapping range queries.
fn dedup_pool<'a>(violations: impl Iterator<Item = &'a Violation>) -> Vec<Violation> {
    let mut seen = HashSet::new();
    violations
        .filter(|v| {
            seen.insert((
                v.component.clone(),
                v.signal.clone(),
                v.timestamp,
                v.value.to_bits(),
            ))
        })
        .cloned()
        .collect()
}

/// Collapse patterns into one hypothesis per root cause.
fn merge_patterns(patterns: Vec<Pattern>) -> Vec<RootCauseHypothesis> {
    let mut grouped: BTreeMap<RootCause, Vec<Pattern>> = BTreeMap::new();
    for p in patterns {
        grouped.entry(p.root_cause).or_default().push(p);
    }

    grouped
        .into_iter()
        .filter_map(|(root_cause, mut group)| {
            group.sort_by(|a, b| {
                b.strength
                    .total_cmp(&a.strength)
                    .then(a.detected_at.cmp(&b.detected_at))
            });
            let lead = group.first()?;

            let mut kinds: Vec<PatternKind> = group.iter().map(|p| p.kind).collect();
            kinds.sort();
            kinds.dedup();

            let mut affected = vec![lead.component.clone()];
            for c in group.iter().flat_map(|p| p.affected.iter()) {
                if !affected.contains(c) {
                    affected.push(c.clone());
                }
            }

            let violations = dedup_pool(group.iter().flat_map(|p| p.violations.iter()));
            let detected_at = group.iter().map(|p| p.detected_at).min()?;

            Some(RootCauseHypothesis {
                root_cause,
                component: lead.component.clone(),
                affected_components: affected,
                confidence: 0.0,
                pattern: lead.kind,
                patterns: kinds,
                strength: lead.strength,
                historical_accuracy: None,
                suppressed: false,
                violations,
                detected_at,
            })
        })
        .collect()
}

/// Confidence desc, then historical accuracy desc, then earliest detection.
fn rank(hypotheses: &mut [RootCauseHypothesis]) {
    hypotheses.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| {
                let acc = |h: &RootCauseHypothesis| h.historical_accuracy.unwrap_or(-1.0);
                acc(b).total_cmp(&acc(a))
            })
            .then(a.detected_at.cmp(&b.detected_at))
    });
}

fn recommend(h: &RootCauseHypothesis, knowledge: &KnowledgeSnapshot) -> String {
    let generic = match h.root_cause {
        RootCause::ResourceExhaustion => "add capacity or restart the service",
        RootCause::NetworkPartition => "move traffic away from the affected path",
        RootCause::CascadingFailure => "isolate the originating component",
        RootCause::ConfigurationDrift => "roll back to the last known good configuration",
        RootCause::ExternalDependencyFailure => "route around or fail over the dependency",
        RootCause::Unknown => "escalate to an operator",
    };

    let mut line = format!(
        "{} on {} ({:?}, confidence {:.2}): {}",
        h.root_cause, h.component, h.pattern, h.confidence, generic
    );
    if let Some((action, confidence)) = knowledge.best_action(h.root_cause) {
        line.push_str(&format!("; historically best action {} ({:.2})", action, confidence));
    }
    if h.suppressed {
        line.push_str("; recent remediation had no measurable effect");
    }
    line
}

/// The category that accounts for most of `violations`, with ties going
/// to the category seen first. Also reports whether it is a strict majority.
pub(crate) fn dominant_category(
    violations: &[Violation],
    config: &AnalyzerConfig,
) -> Option<(SignalCategory, bool)> {
    let mut ordered: Vec<&Violation> = violations.iter().collect();
    ordered.sort_by_key(|v| v.timestamp);

    let mut counts: Vec<(SignalCategory, usize)> = Vec::new();
    for v in ordered {
        let cat = config.category_of(&v.signal);
        match counts.iter_mut().find(|(c, _)| *c == cat) {
            Some((_, n)) => *n += 1,
            None => counts.push((cat, 1)),
        }
    }

    let total = violations.len();
    let mut best: Option<(SignalCategory, usize)> = None;
    for (cat, n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((cat, n));
        }
    }
    best.map(|(cat, n)| (cat, n * 2 > total))
}
