//! Correlated failures across components.
//!
//! Each component's violations are bucketed into a timeline; two timelines
//! that move together (possibly shifted by a few buckets) suggest one
//! failure dragging the other down.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use super::stats::max_lagged_correlation;
use super::{Pattern, PatternKind, RootCause};
use crate::config::AnalyzerConfig;
use crate::monitor::Violation;

pub fn detect(
    pool: &[Violation],
    current: &[Violation],
    config: &AnalyzerConfig,
    now: DateTime<Utc>,
) -> Vec<Pattern> {
    let bucket_sec = config.bucket_sec.max(1);
    let buckets = (config.causal_window_sec / bucket_sec).max(1) as usize;
    let start = now - Duration::seconds((buckets as u64 * bucket_sec) as i64);

    let mut timelines: BTreeMap<&str, (Vec<f64>, Vec<&Violation>)> = BTreeMap::new();
    for v in pool.iter().filter(|v| v.timestamp >= start && v.timestamp <= now) {
        let offset = (v.timestamp - start).num_seconds().max(0) as u64;
        let idx = ((offset / bucket_sec) as usize).min(buckets - 1);
        let entry = timelines
            .entry(v.component.as_str())
            .or_insert_with(|| (vec![0.0; buckets], Vec::new()));
        entry.0[idx] += 1.0;
        entry.1.push(v);
    }

    // Single-bucket timelines correlate with anything and nothing.
    timelines.retain(|_, (series, _)| series.iter().filter(|&&c| c > 0.0).count() >= 2);

    let live: BTreeSet<&str> = current.iter().map(|v| v.component.as_str()).collect();
    let components: Vec<&str> = timelines.keys().copied().collect();
    let mut patterns = Vec::new();

    for (i, a) in components.iter().enumerate() {
        for b in &components[i + 1..] {
            if !live.contains(a) && !live.contains(b) {
                continue;
            }
            let (sa, va) = &timelines[a];
            let (sb, vb) = &timelines[b];
            let Some(r) = max_lagged_correlation(sa, sb, config.max_lag_buckets) else {
                continue;
            };
            if r < config.correlation_threshold {
                continue;
            }

            let first = |vs: &[&Violation]| vs.iter().map(|v| v.timestamp).min();
            let origin = if first(vb) < first(va) { *b } else { *a };
            let violations: Vec<Violation> = va.iter().chain(vb.iter()).map(|v| (*v).clone()).collect();

            if let Some(p) = Pattern::new(
                PatternKind::Causal,
                RootCause::CascadingFailure,
                origin,
                r,
                violations,
            ) {
                patterns.push(p);
            }
        }
    }

    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Severity, ViolationSource};

    fn v(now: DateTime<Utc>, component: &str, secs_ago: i64) -> Violation {
        Violation {
            signal: "error_rate".into(),
            value: 1.0,
            threshold: 0.5,
            severity: Severity::Warning,
            component: component.into(),
            timestamp: now - Duration::seconds(secs_ago),
            source: ViolationSource::Polled,
        }
    }

    #[test]
    fn test_lagged_failure_is_cascading() {
        let now = Utc::now();
        let cfg = AnalyzerConfig::default();
        // db fails in two waves, api follows each wave one bucket later.
        let mut pool = Vec::new();
        for secs in [205, 204, 203, 105, 104] {
            pool.push(v(now, "db", secs));
        }
        for secs in [195, 194, 193, 95, 94] {
            pool.push(v(now, "api", secs));
        }
        let current = vec![v(now, "api", 94)];

        let patterns = detect(&pool, &current, &cfg, now);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].root_cause, RootCause::CascadingFailure);
        assert_eq!(patterns[0].component, "db");
        assert!(patterns[0].strength >= cfg.correlation_threshold);
        assert_eq!(patterns[0].affected, vec!["api".to_string(), "db".to_string()]);
    }

    #[test]
    fn test_unrelated_components_do_not_correlate() {
        let now = Utc::now();
        let cfg = AnalyzerConfig::default();
        let mut pool = Vec::new();
        for secs in [250, 249, 150] {
            pool.push(v(now, "a", secs));
        }
        for secs in [200, 50, 49, 48] {
            pool.push(v(now, "b", secs));
        }
        assert!(detect(&pool, &pool, &cfg, now).is_empty());
    }

    #[test]
    fn test_needs_two_active_buckets() {
        let now = Utc::now();
        let cfg = AnalyzerConfig::default();
        let pool = vec![v(now, "a", 5), v(now, "b", 5)];
        assert!(detect(&pool, &pool, &cfg, now).is_empty());
    }
}
