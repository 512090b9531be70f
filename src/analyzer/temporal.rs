//! Bursts: the same signal breaching repeatedly on one component.

use std::collections::BTreeMap;

use super::{Pattern, PatternKind};
use crate::config::AnalyzerConfig;
use crate::monitor::Violation;

/// `windowed` holds every violation inside the sliding window, `current`
/// only this cycle's. A burst must include at least one current violation.
pub fn detect(windowed: &[Violation], current: &[Violation], config: &AnalyzerConfig) -> Vec<Pattern> {
    let burst = config.burst_count.max(1);

    let mut groups: BTreeMap<(&str, &str), Vec<Violation>> = BTreeMap::new();
    for v in windowed {
        groups
            .entry((v.component.as_str(), v.signal.as_str()))
            .or_default()
            .push(v.clone());
    }

    groups
        .into_iter()
        .filter(|((component, signal), group)| {
            group.len() >= burst
                && current
                    .iter()
                    .any(|v| v.component == *component && v.signal == *signal)
        })
        .filter_map(|((component, signal), group)| {
            let strength = (group.len() as f64 / (2 * burst) as f64).min(1.0);
            let root_cause = config.category_of(signal).root_cause();
            Pattern::new(PatternKind::Temporal, root_cause, component, strength, group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::RootCause;
    use crate::monitor::{Severity, ViolationSource};
    use chrono::{Duration, Utc};

    fn burst(component: &str, signal: &str, n: i64) -> Vec<Violation> {
        let now = Utc::now();
        (0..n)
            .map(|i| Violation {
                signal: signal.into(),
                value: 1.0,
                threshold: 0.5,
                severity: Severity::Warning,
                component: component.into(),
                timestamp: now - Duration::seconds(i),
                source: ViolationSource::Polled,
            })
            .collect()
    }

    #[test]
    fn test_burst_threshold() {
        let cfg = AnalyzerConfig::default();
        let two = burst("web-1", "cpu", 2);
        assert!(detect(&two, &two, &cfg).is_empty());

        let five = burst("web-1", "cpu", 5);
        let patterns = detect(&five, &five, &cfg);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].root_cause, RootCause::ResourceExhaustion);
        assert!((patterns[0].strength - 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_strength_saturates() {
        let cfg = AnalyzerConfig::default();
        let many = burst("web-1", "cpu", 20);
        assert_eq!(detect(&many, &many, &cfg)[0].strength, 1.0);
    }

    #[test]
    fn test_stale_burst_is_ignored() {
        let cfg = AnalyzerConfig::default();
        let old = burst("web-1", "cpu", 5);
        let current = burst("web-2", "cpu", 1);
        assert!(detect(&old, &current, &cfg).is_empty());
    }
}
