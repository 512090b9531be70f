//! Co-location: several distinct signals breaching on one component.

use std::collections::{BTreeMap, BTreeSet};

use super::{dominant_category, Pattern, PatternKind};
use crate::config::AnalyzerConfig;
use crate::monitor::Violation;

pub fn detect(windowed: &[Violation], current: &[Violation], config: &AnalyzerConfig) -> Vec<Pattern> {
    let min = config.spatial_min_signals.max(2);

    let mut by_component: BTreeMap<&str, Vec<Violation>> = BTreeMap::new();
    for v in windowed {
        by_component
            .entry(v.component.as_str())
            .or_default()
            .push(v.clone());
    }

    by_component
        .into_iter()
        .filter(|(component, _)| current.iter().any(|v| v.component == *component))
        .filter_map(|(component, group)| {
            let distinct: BTreeSet<&str> = group.iter().map(|v| v.signal.as_str()).collect();
            if distinct.len() < min {
                return None;
            }
            let strength = (distinct.len() as f64 / (min + 1) as f64).min(1.0);
            let (category, _) = dominant_category(&group, config)?;
            Pattern::new(
                PatternKind::Spatial,
                category.root_cause(),
                component,
                strength,
                group,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::RootCause;
    use crate::monitor::{Severity, ViolationSource};
    use chrono::{Duration, Utc};

    fn v(component: &str, signal: &str, secs_ago: i64) -> Violation {
        Violation {
            signal: signal.into(),
            value: 1.0,
            threshold: 0.5,
            severity: Severity::Warning,
            component: component.into(),
            timestamp: Utc::now() - Duration::seconds(secs_ago),
            source: ViolationSource::Polled,
        }
    }

    #[test]
    fn test_colocated_signals() {
        let cfg = AnalyzerConfig::default();
        let vs = vec![
            v("db-1", "cpu_percent", 3),
            v("db-1", "memory_percent", 2),
            v("db-2", "cpu_percent", 1),
        ];
        let patterns = detect(&vs, &vs, &cfg);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].component, "db-1");
        assert_eq!(patterns[0].root_cause, RootCause::ResourceExhaustion);
        assert!((patterns[0].strength - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_categories_follow_the_majority() {
        let cfg = AnalyzerConfig::default();
        let vs = vec![
            v("edge-1", "cpu_percent", 5),
            v("edge-1", "packet_loss", 4),
            v("edge-1", "packet_loss", 3),
            v("edge-1", "dns_failures", 2),
        ];
        let patterns = detect(&vs, &vs, &cfg);
        assert_eq!(patterns[0].root_cause, RootCause::NetworkPartition);
        assert_eq!(patterns[0].strength, 1.0);
    }
}
