//! Remediation planning.
//!
//! Each hypothesis is answered with candidate policies built from the action
//! catalog, scored by benefit over cost, and trimmed to the top candidates.
//! Every planned action carries its compensation, resolved by exhaustive
//! match on the closed [`Action`] enum.

pub mod catalog;
pub mod scoring;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::analyzer::{AnalysisResult, RootCause, RootCauseHypothesis};
use crate::config::{Autonomy, PlannerConfig};
use crate::knowledge::{Confidence, KnowledgeSnapshot};

#[derive(Debug, Error, PartialEq)]
#[error("unknown action `{0}`")]
pub struct UnknownAction(pub String);

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    RestartService,
    RerouteTraffic,
    ClearCache,
    ScaleOut,
    ScaleIn,
    Failover,
    QuarantineNode,
    RollbackConfig,
    Escalate,
    /// Only ever planned as the compensation of a quarantine.
    ReleaseNode,
}

impl ActionKind {
    /// Kinds the planner may choose from.
    pub const CATALOG: [ActionKind; 9] = [
        ActionKind::RestartService,
        ActionKind::RerouteTraffic,
        ActionKind::ClearCache,
        ActionKind::ScaleOut,
        ActionKind::ScaleIn,
        ActionKind::Failover,
        ActionKind::QuarantineNode,
        ActionKind::RollbackConfig,
        ActionKind::Escalate,
    ];

    pub const ALL: [ActionKind; 10] = [
        ActionKind::RestartService,
        ActionKind::RerouteTraffic,
        ActionKind::ClearCache,
        ActionKind::ScaleOut,
        ActionKind::ScaleIn,
        ActionKind::Failover,
        ActionKind::QuarantineNode,
        ActionKind::RollbackConfig,
        ActionKind::Escalate,
        ActionKind::ReleaseNode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RestartService => "restart-service",
            ActionKind::RerouteTraffic => "reroute-traffic",
            ActionKind::ClearCache => "clear-cache",
            ActionKind::ScaleOut => "scale-out",
            ActionKind::ScaleIn => "scale-in",
            ActionKind::Failover => "failover",
            ActionKind::QuarantineNode => "quarantine-node",
            ActionKind::RollbackConfig => "rollback-config",
            ActionKind::Escalate => "escalate",
            ActionKind::ReleaseNode => "release-node",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// A concrete remediation step with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Action {
    RestartService {
        component: String,
    },
    RerouteTraffic {
        component: String,
        from: String,
        to: String,
    },
    ClearCache {
        component: String,
    },
    ScaleOut {
        component: String,
        from_replicas: u32,
        to_replicas: u32,
    },
    ScaleIn {
        component: String,
        from_replicas: u32,
        to_replicas: u32,
    },
    Failover {
        component: String,
        from: String,
        to: String,
    },
    QuarantineNode {
        component: String,
    },
    RollbackConfig {
        component: String,
        from_revision: String,
        to_revision: String,
    },
    Escalate {
        component: String,
        reason: String,
    },
    ReleaseNode {
        component: String,
    },
}

/// What undoes an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum Compensation {
    Apply(Action),
    /// Nothing to undo, with the reason why.
    NoOp(String),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::RestartService { .. } => ActionKind::RestartService,
            Action::RerouteTraffic { .. } => ActionKind::RerouteTraffic,
            Action::ClearCache { .. } => ActionKind::ClearCache,
            Action::ScaleOut { .. } => ActionKind::ScaleOut,
            Action::ScaleIn { .. } => ActionKind::ScaleIn,
            Action::Failover { .. } => ActionKind::Failover,
            Action::QuarantineNode { .. } => ActionKind::QuarantineNode,
            Action::RollbackConfig { .. } => ActionKind::RollbackConfig,
            Action::Escalate { .. } => ActionKind::Escalate,
            Action::ReleaseNode { .. } => ActionKind::ReleaseNode,
        }
    }

    pub fn component(&self) -> &str {
        match self {
            Action::RestartService { component }
            | Action::RerouteTraffic { component, .. }
            | Action::ClearCache { component }
            | Action::ScaleOut { component, .. }
            | Action::ScaleIn { component, .. }
            | Action::Failover { component, .. }
            | Action::QuarantineNode { component }
            | Action::RollbackConfig { component, .. }
            | Action::Escalate { component, .. }
            | Action::ReleaseNode { component } => component,
        }
    }

    pub fn compensation(&self) -> Compensation {
        use Compensation::{Apply, NoOp};
        match self.clone() {
            Action::RestartService { .. } => NoOp("a restart leaves nothing to undo".into()),
            Action::ClearCache { .. } => NoOp("caches refill on demand".into()),
            Action::Escalate { .. } => NoOp("escalation only notifies operators".into()),
            Action::ScaleOut {
                component,
                from_replicas,
                to_replicas,
            } => Apply(Action::ScaleIn {
                component,
                from_replicas: to_replicas,
                to_replicas: from_replicas,
            }),
            Action::ScaleIn {
                component,
                from_replicas,
                to_replicas,
            } => Apply(Action::ScaleOut {
                component,
                from_replicas: to_replicas,
                to_replicas: from_replicas,
            }),
            Action::RerouteTraffic {
                component,
                from,
                to,
            } => Apply(Action::RerouteTraffic {
                component,
                from: to,
                to: from,
            }),
            Action::Failover {
                component,
                from,
                to,
            } => Apply(Action::Failover {
                component,
                from: to,
                to: from,
            }),
            Action::QuarantineNode { component } => Apply(Action::ReleaseNode { component }),
            Action::ReleaseNode { component } => Apply(Action::QuarantineNode { component }),
            Action::RollbackConfig {
                component,
                from_revision,
                to_revision,
            } => Apply(Action::RollbackConfig {
                component,
                from_revision: to_revision,
                to_revision: from_revision,
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ScaleOut {
                component,
                from_replicas,
                to_replicas,
            }
            | Action::ScaleIn {
                component,
                from_replicas,
                to_replicas,
            } => write!(f, "{} {} {}->{}", self.kind(), component, from_replicas, to_replicas),
            Action::RerouteTraffic { component, from, to }
            | Action::Failover { component, from, to } => {
                write!(f, "{} {} {}->{}", self.kind(), component, from, to)
            }
            Action::RollbackConfig {
                component,
                from_revision,
                to_revision,
            } => write!(f, "{} {} {}->{}", self.kind(), component, from_revision, to_revision),
            _ => write!(f, "{} {}", self.kind(), self.component()),
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action: Action,
    pub compensation: Compensation,
}

impl PlannedAction {
    pub fn new(action: Action) -> Self {
        let compensation = action.compensation();
        Self {
            action,
            compensation,
        }
    }
}

/// An ordered set of actions answering one hypothesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPolicy {
    pub id: Uuid,
    pub root_cause: RootCause,
    pub component: String,
    pub actions: Vec<PlannedAction>,
    pub estimated_cost: f64,
    pub estimated_benefit: f64,
    pub blast_radius: f64,
    /// Learned confidence for (root cause, primary action).
    pub confidence: Confidence,
    pub approval_required: bool,
    pub approval_reason: Option<String>,
    pub hypothesis_confidence: f64,
    /// Signals that were breaching on the target when the policy was made.
    pub signals: Vec<String>,
    /// Earliest contributing violation.
    pub detected_at: DateTime<Utc>,
}

impl RemediationPolicy {
    pub fn score(&self) -> f64 {
        self.estimated_benefit / self.estimated_cost
    }

    pub fn primary_action(&self) -> ActionKind {
        self.actions
            .first()
            .map_or(ActionKind::Escalate, |a| a.action.kind())
    }

    pub fn action_kinds(&self) -> Vec<ActionKind> {
        self.actions.iter().map(|a| a.action.kind()).collect()
    }
}

/// Score desc, then blast radius asc.
pub fn compare_policies(a: &RemediationPolicy, b: &RemediationPolicy) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then(a.blast_radius.total_cmp(&b.blast_radius))
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn reconfigure(&mut self, config: PlannerConfig) {
        self.config = config;
    }

    /// Ranked candidate policies for every hypothesis in `analysis`.
    pub fn plan(&self, analysis: &AnalysisResult, knowledge: &KnowledgeSnapshot) -> Vec<RemediationPolicy> {
        let keep = match self.config.autonomy {
            Autonomy::FullAuto => 1,
            Autonomy::Supervised => self.config.top_k.max(1),
        };

        let mut policies = Vec::new();
        for hypothesis in &analysis.hypotheses {
            for component in self.targets(hypothesis) {
                let mut candidates = self.candidates(hypothesis, component, knowledge);
                candidates.sort_by(compare_policies);
                candidates.truncate(keep);
                policies.extend(candidates);
            }
        }
        policies.sort_by(compare_policies);

        if !policies.is_empty() {
            info!(
                policies = policies.len(),
                top = %policies[0].primary_action(),
                component = %policies[0].component,
                score = policies[0].score(),
                "planning complete"
            );
        }
        policies
    }

    /// Components to remediate for one hypothesis: the lead, then affected
    /// components with breaches of their own. A cascading failure is fixed
    /// at its origin, and an unknown cause only escalates the lead.
    fn targets<'h>(&self, hypothesis: &'h RootCauseHypothesis) -> Vec<&'h str> {
        let lead = hypothesis.component.as_str();
        if matches!(hypothesis.root_cause, RootCause::CascadingFailure | RootCause::Unknown) {
            return vec![lead];
        }

        let mut targets = vec![lead];
        for component in &hypothesis.affected_components {
            if targets.len() >= self.config.max_targets.max(1) {
                break;
            }
            if component != lead && !hypothesis.signals_on(component).is_empty() {
                targets.push(component.as_str());
            }
        }
        targets
    }

    fn candidates(
        &self,
        hypothesis: &RootCauseHypothesis,
        component: &str,
        knowledge: &KnowledgeSnapshot,
    ) -> Vec<RemediationPolicy> {
        let mut topology = self.config.profile(component);
        if let Some(replicas) = knowledge.replicas(component) {
            topology.replicas = replicas;
        }
        let reason = format!(
            "{} suspected on {} (confidence {:.2})",
            hypothesis.root_cause, component, hypothesis.confidence
        );

        let mut out = Vec::new();
        for template in catalog::templates(hypothesis.root_cause) {
            if let Some(actions) = self.resolve(template, component, &topology, &reason) {
                out.push(self.build(hypothesis, component, actions, knowledge));
            } else {
                debug!(
                    component = %component,
                    template = ?template,
                    "template not applicable"
                );
            }
        }

        if out.is_empty() {
            let fallback = catalog::instantiate(ActionKind::Escalate, component, &topology, &reason)
                .map(|a| vec![a]);
            if let Some(actions) = fallback {
                out.push(self.build(hypothesis, component, actions, knowledge));
            }
        }
        out
    }

    fn resolve(
        &self,
        template: &[ActionKind],
        component: &str,
        topology: &crate::config::ComponentProfile,
        reason: &str,
    ) -> Option<Vec<Action>> {
        template
            .iter()
            .map(|&kind| {
                if !self.config.action_enabled(kind) {
                    return None;
                }
                catalog::instantiate(kind, component, topology, reason)
            })
            .collect()
    }

    fn build(
        &self,
        hypothesis: &RootCauseHypothesis,
        component: &str,
        actions: Vec<Action>,
        knowledge: &KnowledgeSnapshot,
    ) -> RemediationPolicy {
        let kinds: Vec<ActionKind> = actions.iter().map(Action::kind).collect();
        let primary = kinds[0];
        let confidence = knowledge.confidence(hypothesis.root_cause, primary);

        let cost = scoring::cost(&kinds, &self.config);
        let severity = scoring::severity_score(hypothesis.critical_fraction());
        let benefit = scoring::benefit(confidence, severity, &self.config);
        let blast = scoring::policy_blast_radius(&kinds, &self.config);

        let approval_reason = if primary == ActionKind::Escalate {
            None
        } else if !confidence.is_known() {
            Some(format!(
                "no reliable history for {} on {}",
                primary, hypothesis.root_cause
            ))
        } else if self.config.autonomy == Autonomy::Supervised
            && blast > self.config.approval_blast_radius
        {
            Some(format!(
                "blast radius {:.2} exceeds {:.2}",
                blast, self.config.approval_blast_radius
            ))
        } else {
            None
        };

        RemediationPolicy {
            id: Uuid::new_v4(),
            root_cause: hypothesis.root_cause,
            component: component.to_string(),
            actions: actions.into_iter().map(PlannedAction::new).collect(),
            estimated_cost: cost,
            estimated_benefit: benefit,
            blast_radius: blast,
            confidence,
            approval_required: approval_reason.is_some(),
            approval_reason,
            hypothesis_confidence: hypothesis.confidence,
            signals: hypothesis.signals_on(component),
            detected_at: hypothesis.detected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::PatternKind;
    use crate::config::ComponentProfile;
    use crate::knowledge::PairStats;
    use crate::monitor::{Severity, Violation, ViolationSource};

    fn hypothesis(root_cause: RootCause, component: &str) -> RootCauseHypothesis {
        let now = Utc::now();
        RootCauseHypothesis {
            root_cause,
            component: component.into(),
            affected_components: vec![component.into()],
            confidence: 0.8,
            pattern: PatternKind::Temporal,
            patterns: vec![PatternKind::Temporal],
            strength: 0.8,
            historical_accuracy: None,
            suppressed: false,
            violations: vec![Violation {
                signal: "cpu".into(),
                value: 99.0,
                threshold: 90.0,
                severity: Severity::Warning,
                component: component.into(),
                timestamp: now,
                source: ViolationSource::Polled,
            }],
            detected_at: now,
        }
    }

    fn analysis(hs: Vec<RootCauseHypothesis>) -> AnalysisResult {
        AnalysisResult {
            hypotheses: hs,
            recommendations: Vec::new(),
        }
    }

    fn learned(pairs: &[(RootCause, ActionKind, u64, u64)]) -> KnowledgeSnapshot {
        let mut snap = KnowledgeSnapshot::with_min_sample_size(5);
        for &(rc, action, s, f) in pairs {
            snap.insert(
                rc,
                action,
                PairStats {
                    success_count: s,
                    failure_count: f,
                    ..PairStats::default()
                },
            );
        }
        snap
    }

    #[test]
    fn test_compensation_inverts_parameters() {
        let out = Action::ScaleOut {
            component: "web".into(),
            from_replicas: 2,
            to_replicas: 4,
        };
        assert_eq!(
            out.compensation(),
            Compensation::Apply(Action::ScaleIn {
                component: "web".into(),
                from_replicas: 4,
                to_replicas: 2
            })
        );
        assert!(matches!(
            Action::RestartService { component: "web".into() }.compensation(),
            Compensation::NoOp(_)
        ));
        assert_eq!(
            Action::QuarantineNode { component: "n1".into() }.compensation(),
            Compensation::Apply(Action::ReleaseNode { component: "n1".into() })
        );
    }

    #[test]
    fn test_action_kind_strings() {
        for kind in ActionKind::ALL {
            assert_eq!(kind.as_str().parse::<ActionKind>().unwrap(), kind);
            assert_eq!(serde_json::to_string(&kind).unwrap(), format!("\"{}\"", kind.as_str()));
        }
        let json = serde_json::to_value(Action::ClearCache { component: "c".into() }).unwrap();
        assert_eq!(json["kind"], "clear-cache");
    }

    #[test]
    fn test_learned_confidence_picks_scale_out() {
        let planner = Planner::new(PlannerConfig::default());
        let knowledge = learned(&[
            (RootCause::ResourceExhaustion, ActionKind::ScaleOut, 9, 1),
            (RootCause::ResourceExhaustion, ActionKind::RestartService, 2, 8),
        ]);

        let policies = planner.plan(
            &analysis(vec![hypothesis(RootCause::ResourceExhaustion, "X")]),
            &knowledge,
        );

        assert_eq!(policies.len(), 3);
        assert_eq!(policies[0].primary_action(), ActionKind::ScaleOut);
        assert!(!policies[0].approval_required);
        for pair in policies.windows(2) {
            assert!(pair[0].score() >= pair[1].score());
        }
        // clear-cache has no history yet.
        let cache = policies
            .iter()
            .find(|p| p.primary_action() == ActionKind::ClearCache)
            .unwrap();
        assert!(cache.approval_required);
    }

    #[test]
    fn test_full_auto_keeps_single_candidate() {
        let mut cfg = PlannerConfig::default();
        cfg.autonomy = Autonomy::FullAuto;
        let planner = Planner::new(cfg);
        let policies = planner.plan(
            &analysis(vec![hypothesis(RootCause::ResourceExhaustion, "X")]),
            &KnowledgeSnapshot::default(),
        );
        assert_eq!(policies.len(), 1);
    }

    #[test]
    fn test_wide_blast_radius_needs_approval_when_supervised() {
        let mut cfg = PlannerConfig::default();
        cfg.components.insert(
            "db".into(),
            ComponentProfile {
                standby: Some("db-replica".into()),
                ..ComponentProfile::default()
            },
        );
        let knowledge = learned(&[(RootCause::NetworkPartition, ActionKind::Failover, 10, 0)]);
        let result = analysis(vec![hypothesis(RootCause::NetworkPartition, "db")]);

        let supervised = Planner::new(cfg.clone()).plan(&result, &knowledge);
        let failover = supervised
            .iter()
            .find(|p| p.primary_action() == ActionKind::Failover)
            .unwrap();
        assert!(failover.approval_required);

        cfg.autonomy = Autonomy::FullAuto;
        let auto = Planner::new(cfg).plan(&result, &knowledge);
        assert_eq!(auto[0].primary_action(), ActionKind::Failover);
        assert!(!auto[0].approval_required);
    }

    #[test]
    fn test_unresolvable_templates_fall_back_to_escalate() {
        let planner = Planner::new(PlannerConfig::default());
        // No standby and no alternate route configured.
        let policies = planner.plan(
            &analysis(vec![hypothesis(RootCause::ExternalDependencyFailure, "payments")]),
            &KnowledgeSnapshot::default(),
        );
        // clear-cache still resolves.
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].primary_action(), ActionKind::ClearCache);

        let mut cfg = PlannerConfig::default();
        cfg.actions.insert(ActionKind::ClearCache, false);
        let policies = Planner::new(cfg).plan(
            &analysis(vec![hypothesis(RootCause::ExternalDependencyFailure, "payments")]),
            &KnowledgeSnapshot::default(),
        );
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].primary_action(), ActionKind::Escalate);
        assert!(!policies[0].approval_required);
    }

    #[test]
    fn test_every_action_has_explicit_compensation() {
        let planner = Planner::new(PlannerConfig::default());
        let policies = planner.plan(
            &analysis(vec![hypothesis(RootCause::ConfigurationDrift, "api")]),
            &KnowledgeSnapshot::default(),
        );
        for policy in &policies {
            for planned in &policy.actions {
                assert_eq!(planned.compensation, planned.action.compensation());
            }
        }
    }

    #[test]
    fn test_scale_out_starts_from_recorded_replicas() {
        let mut cfg = PlannerConfig::default();
        cfg.autonomy = Autonomy::FullAuto;
        cfg.components.insert(
            "web".into(),
            ComponentProfile {
                replicas: 2,
                max_replicas: 4,
                ..ComponentProfile::default()
            },
        );
        let planner = Planner::new(cfg);
        let mut knowledge = learned(&[(RootCause::ResourceExhaustion, ActionKind::ScaleOut, 10, 0)]);
        let result = analysis(vec![hypothesis(RootCause::ResourceExhaustion, "web")]);

        let first = planner.plan(&result, &knowledge);
        assert_eq!(
            first[0].actions[0].action,
            Action::ScaleOut {
                component: "web".into(),
                from_replicas: 2,
                to_replicas: 3
            }
        );

        knowledge.set_replicas("web", 3);
        let second = planner.plan(&result, &knowledge);
        assert_eq!(
            second[0].actions[0].action,
            Action::ScaleOut {
                component: "web".into(),
                from_replicas: 3,
                to_replicas: 4
            }
        );

        // At the ceiling there is nothing left to add.
        knowledge.set_replicas("web", 4);
        let third = planner.plan(&result, &knowledge);
        assert!(third.iter().all(|p| p.primary_action() != ActionKind::ScaleOut));
    }

    #[test]
    fn test_affected_components_with_breaches_get_their_own_policies() {
        let mut h = hypothesis(RootCause::ResourceExhaustion, "web-1");
        h.affected_components = vec!["web-1".into(), "web-2".into(), "web-3".into(), "web-4".into()];
        for c in ["web-2", "web-4"] {
            let mut v = h.violations[0].clone();
            v.component = c.into();
            v.signal = "mem".into();
            h.violations.push(v);
        }

        let mut cfg = PlannerConfig::default();
        cfg.autonomy = Autonomy::FullAuto;
        let policies = Planner::new(cfg.clone()).plan(&analysis(vec![h.clone()]), &KnowledgeSnapshot::default());
        let mut targets: Vec<&str> = policies.iter().map(|p| p.component.as_str()).collect();
        targets.sort();
        // web-3 has no breach of its own.
        assert_eq!(targets, vec!["web-1", "web-2", "web-4"]);
        let web2 = policies.iter().find(|p| p.component == "web-2").unwrap();
        assert_eq!(web2.signals, vec!["mem".to_string()]);
        assert!(web2.actions.iter().all(|a| a.action.component() == "web-2"));

        cfg.max_targets = 2;
        let capped = Planner::new(cfg.clone()).plan(&analysis(vec![h.clone()]), &KnowledgeSnapshot::default());
        assert_eq!(capped.len(), 2);

        h.root_cause = RootCause::CascadingFailure;
        let cascade = Planner::new(cfg).plan(&analysis(vec![h]), &KnowledgeSnapshot::default());
        assert!(cascade.iter().all(|p| p.component == "web-1"));
    }

    #[test]
    fn test_empty_analysis_plans_nothing() {
        let planner = Planner::new(PlannerConfig::default());
        assert!(planner
            .plan(&AnalysisResult::default(), &KnowledgeSnapshot::default())
            .is_empty());
    }
}
