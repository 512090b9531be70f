//! Violation-rate anomalies against each component's rolling baseline.

use std::collections::BTreeMap;

use super::stats::TimeSeries;
use super::{dominant_category, AnalysisHistory, Pattern, PatternKind, RootCause};
use crate::config::AnalyzerConfig;
use crate::monitor::Violation;

pub fn detect(history: &AnalysisHistory, current: &[Violation], config: &AnalyzerConfig) -> Vec<Pattern> {
    let mut by_component: BTreeMap<&str, Vec<Violation>> = BTreeMap::new();
    for v in current {
        by_component
            .entry(v.component.as_str())
            .or_default()
            .push(v.clone());
    }

    by_component
        .into_iter()
        .filter_map(|(component, violations)| {
            let baseline = TimeSeries::new(history.counts_for(component, config.baseline_cycles));
            let count = violations.len() as f64;
            let z = baseline.z_score(count, config.min_baseline_cycles).ok()?;
            if !(z > config.k_sigma) || count <= baseline.mean() {
                return None;
            }

            let strength = 0.5 + 0.5 * (1.0 - config.k_sigma / z);
            let root_cause = match dominant_category(&violations, config) {
                Some((category, true)) => category.root_cause(),
                _ => RootCause::Unknown,
            };
            Pattern::new(PatternKind::Frequency, root_cause, component, strength, violations)
        })
        .collect()
}
