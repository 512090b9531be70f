//! Prometheus metrics for the control loop.

use std::sync::Arc;

use anyhow::Context;
use prometheus::{
    register_gauge_vec_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, GaugeVec,
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::knowledge::{Confidence, KnowledgeSnapshot, Outcome};
use crate::orchestrator::CyclePhase;

/// Loop metrics, registered on a private registry.
#[derive(Clone)]
pub struct HealMetrics {
    pub cycle_duration_seconds: Histogram,
    pub phase_duration_seconds: HistogramVec,
    pub cycles_total: IntCounterVec,
    pub cycle_failures_total: IntCounterVec,
    pub violations_detected_total: IntCounter,
    pub policies_executed_total: IntCounter,
    pub policies_deferred_total: IntCounterVec,
    pub execution_outcomes_total: IntCounterVec,
    pub pair_confidence: GaugeVec,
    pub threshold_factor: GaugeVec,
    pub monitor_degraded: IntGauge,
    pub pending_approvals: IntGauge,
    pub mttr_seconds: Histogram,

    registry: Arc<Registry>,
}

impl HealMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let cycle_duration_seconds = register_histogram_with_registry!(
            "autoheal_cycle_duration_seconds",
            "Wall time of one control cycle",
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            registry
        )?;

        let phase_duration_seconds = register_histogram_vec_with_registry!(
            "autoheal_phase_duration_seconds",
            "Wall time of one cycle phase, including failed attempts",
            &["phase"],
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            registry
        )?;

        let cycles_total = register_int_counter_vec_with_registry!(
            "autoheal_cycles_total",
            "Control cycles by result",
            &["result"],
            registry
        )?;

        let cycle_failures_total = register_int_counter_vec_with_registry!(
            "autoheal_cycle_failures_total",
            "Abandoned cycles by the phase that failed",
            &["phase"],
            registry
        )?;

        let violations_detected_total = register_int_counter_with_registry!(
            "autoheal_violations_detected_total",
            "Violations produced by the monitor",
            registry
        )?;

        let policies_executed_total = register_int_counter_with_registry!(
            "autoheal_policies_executed_total",
            "Policies that reached a terminal execution state",
            registry
        )?;

        let policies_deferred_total = register_int_counter_vec_with_registry!(
            "autoheal_policies_deferred_total",
            "Policies not started, by reason",
            &["reason"],
            registry
        )?;

        let execution_outcomes_total = register_int_counter_vec_with_registry!(
            "autoheal_execution_outcomes_total",
            "Recorded remediation outcomes",
            &["outcome"],
            registry
        )?;

        let pair_confidence = register_gauge_vec_with_registry!(
            "autoheal_pair_confidence",
            "Learned confidence per root cause and action",
            &["root_cause", "action"],
            registry
        )?;

        let threshold_factor = register_gauge_vec_with_registry!(
            "autoheal_threshold_factor",
            "Learned multiplier on a signal's configured threshold",
            &["signal"],
            registry
        )?;

        let monitor_degraded = register_int_gauge_with_registry!(
            "autoheal_monitor_degraded",
            "1 when the last collection skipped signals",
            registry
        )?;

        let pending_approvals = register_int_gauge_with_registry!(
            "autoheal_pending_approvals",
            "Policies waiting for an operator",
            registry
        )?;

        let mttr_seconds = register_histogram_with_registry!(
            "autoheal_mttr_seconds",
            "Time from first detection to a terminal execution",
            vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0],
            registry
        )?;

        for outcome in Outcome::ALL {
            execution_outcomes_total.with_label_values(&[outcome.as_str()]);
        }

        Ok(Self {
            cycle_duration_seconds,
            phase_duration_seconds,
            cycles_total,
            cycle_failures_total,
            violations_detected_total,
            policies_executed_total,
            policies_deferred_total,
            execution_outcomes_total,
            pair_confidence,
            threshold_factor,
            monitor_degraded,
            pending_approvals,
            mttr_seconds,
            registry: Arc::new(registry),
        })
    }

    pub fn record_cycle(&self, result: &str, seconds: f64) {
        self.cycles_total.with_label_values(&[result]).inc();
        self.cycle_duration_seconds.observe(seconds);
    }

    pub fn record_phase(&self, phase: CyclePhase, seconds: f64) {
        self.phase_duration_seconds
            .with_label_values(&[phase.as_str()])
            .observe(seconds);
    }

    pub fn record_cycle_failure(&self, phase: CyclePhase) {
        self.cycle_failures_total
            .with_label_values(&[phase.as_str()])
            .inc();
    }

    pub fn record_outcome(&self, outcome: Outcome, mttr_sec: Option<f64>) {
        self.policies_executed_total.inc();
        self.execution_outcomes_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        if let Some(mttr) = mttr_sec {
            self.mttr_seconds.observe(mttr);
        }
    }

    pub fn record_deferred(&self, reason: &str) {
        self.policies_deferred_total.with_label_values(&[reason]).inc();
    }

    /// Mirror the snapshot's confidences. Pairs whose confidence is unknown
    /// have no series.
    pub fn update_confidence(&self, snapshot: &KnowledgeSnapshot) {
        for insight in snapshot.insights() {
            let labels = [insight.root_cause_type.as_str(), insight.action_type.as_str()];
            match insight.confidence {
                Confidence::Known(c) => self.pair_confidence.with_label_values(&labels).set(c),
                Confidence::Unknown => {
                    // Absent label sets are fine.
                    let _ = self.pair_confidence.remove_label_values(&labels);
                }
            }
        }
    }

    pub fn update_thresholds(&self, snapshot: &KnowledgeSnapshot) {
        for (signal, factor) in snapshot.threshold_factors() {
            self.threshold_factor.with_label_values(&[signal.as_str()]).set(*factor);
        }
    }

    /// Render every metric in the Prometheus text format.
    pub fn export(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics are not valid UTF-8")
    }
}
