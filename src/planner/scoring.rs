//! Cost and benefit estimates for candidate policies.

use super::catalog;
use super::ActionKind;
use crate::config::PlannerConfig;
use crate::knowledge::Confidence;

/// Effective blast radius of one action kind, honouring overrides.
pub fn blast_radius(kind: ActionKind, config: &PlannerConfig) -> f64 {
    config
        .blast_radius
        .get(&kind)
        .copied()
        .unwrap_or_else(|| catalog::profile(kind).blast_radius)
}

/// A policy is as wide as its widest action.
pub fn policy_blast_radius(kinds: &[ActionKind], config: &PlannerConfig) -> f64 {
    kinds
        .iter()
        .map(|&k| blast_radius(k, config))
        .fold(0.0, f64::max)
}

/// Weighted blast radius, downtime and reversibility, summed over the
/// actions and floored at `min_cost`.
pub fn cost(kinds: &[ActionKind], config: &PlannerConfig) -> f64 {
    let w = &config.cost_weights;
    let norm = if config.downtime_norm_sec > 0.0 {
        config.downtime_norm_sec
    } else {
        1.0
    };

    let total: f64 = kinds
        .iter()
        .map(|&k| {
            let p = catalog::profile(k);
            w.blast_radius * blast_radius(k, config)
                + w.downtime * (p.downtime_sec / norm).min(1.0)
                + w.reversibility * p.reversibility_penalty
        })
        .sum();

    total.max(config.min_cost)
}

/// 0.5 when nothing is critical, 1.0 when everything is.
pub fn severity_score(critical_fraction: f64) -> f64 {
    0.5 + 0.5 * critical_fraction.clamp(0.0, 1.0)
}

/// Weighted resolution probability and severity addressed.
pub fn benefit(confidence: Confidence, severity: f64, config: &PlannerConfig) -> f64 {
    let p = confidence.value().unwrap_or(config.unknown_prior);
    let w = &config.benefit_weights;
    w.resolution * p + w.severity * severity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_components() {
        let cfg = PlannerConfig::default();
        // 0.5 * 0.2
        assert!((cost(&[ActionKind::ScaleOut], &cfg) - 0.1).abs() < 1e-9);
        // 0.5 * 0.3 + 0.3 * (10 / 60) + 0.2 * 0.2
        assert!((cost(&[ActionKind::RestartService], &cfg) - 0.24).abs() < 1e-9);
        // Escalate costs nothing but is floored.
        assert_eq!(cost(&[ActionKind::Escalate], &cfg), cfg.min_cost);
    }

    #[test]
    fn test_cost_is_additive() {
        let cfg = PlannerConfig::default();
        let both = cost(&[ActionKind::RollbackConfig, ActionKind::RestartService], &cfg);
        let sum = cost(&[ActionKind::RollbackConfig], &cfg) + cost(&[ActionKind::RestartService], &cfg);
        assert!((both - sum).abs() < 1e-9);
    }

    #[test]
    fn test_blast_override() {
        let mut cfg = PlannerConfig::default();
        cfg.blast_radius.insert(ActionKind::Failover, 0.2);
        assert_eq!(blast_radius(ActionKind::Failover, &cfg), 0.2);
        assert_eq!(
            policy_blast_radius(&[ActionKind::QuarantineNode, ActionKind::Failover], &cfg),
            0.5
        );
    }

    #[test]
    fn test_benefit_uses_prior_when_unknown() {
        let cfg = PlannerConfig::default();
        let known = benefit(Confidence::Known(0.9), 0.5, &cfg);
        let unknown = benefit(Confidence::Unknown, 0.5, &cfg);
        assert!((known - (0.7 * 0.9 + 0.15)).abs() < 1e-9);
        assert!((unknown - (0.7 * 0.25 + 0.15)).abs() < 1e-9);
        assert_eq!(severity_score(1.0), 1.0);
    }
}
