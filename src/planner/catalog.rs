//! The remediation catalog: what each action costs, which actions answer
//! which root cause, and how an action kind becomes a concrete [`Action`].

use super::ActionKind::*;
use super::{Action, ActionKind};
use crate::analyzer::RootCause;
use crate::config::ComponentProfile;

/// Static impact attributes of an action kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionProfile {
    /// Share of the system touched, in [0, 1].
    pub blast_radius: f64,
    /// Expected unavailability while the action runs.
    pub downtime_sec: f64,
    /// How hard the action is to undo, in [0, 1].
    pub reversibility_penalty: f64,
}

pub fn profile(kind: ActionKind) -> ActionProfile {
    let (blast_radius, downtime_sec, reversibility_penalty) = match kind {
        ActionKind::RestartService => (0.3, 10.0, 0.2),
        ActionKind::RerouteTraffic => (0.4, 0.0, 0.0),
        ActionKind::ClearCache => (0.1, 0.0, 0.1),
        ActionKind::ScaleOut => (0.2, 0.0, 0.0),
        ActionKind::ScaleIn => (0.3, 0.0, 0.0),
        ActionKind::Failover => (0.7, 5.0, 0.1),
        ActionKind::QuarantineNode => (0.5, 0.0, 0.0),
        ActionKind::RollbackConfig => (0.5, 5.0, 0.1),
        ActionKind::Escalate => (0.0, 0.0, 0.0),
        ActionKind::ReleaseNode => (0.2, 0.0, 0.0),
    };
    ActionProfile {
        blast_radius,
        downtime_sec,
        reversibility_penalty,
    }
}

/// Candidate action sequences for a root cause, primary action first.
pub fn templates(root_cause: RootCause) -> &'static [&'static [ActionKind]] {
    match root_cause {
        RootCause::ResourceExhaustion => &[&[ScaleOut], &[RestartService], &[ClearCache]],
        RootCause::NetworkPartition => &[
            &[RerouteTraffic],
            &[Failover],
            &[QuarantineNode, RerouteTraffic],
        ],
        RootCause::CascadingFailure => &[&[QuarantineNode], &[RerouteTraffic], &[Failover]],
        RootCause::ConfigurationDrift => &[&[RollbackConfig, RestartService], &[RestartService]],
        RootCause::ExternalDependencyFailure => {
            &[&[RerouteTraffic], &[Failover], &[ClearCache]]
        }
        RootCause::Unknown => &[&[Escalate]],
    }
}

/// Fill in `kind`'s parameters from what is known about `component`.
///
/// `None` when the topology does not allow the action, e.g. scaling out a
/// component already at its replica ceiling or failing over without a
/// standby.
pub fn instantiate(
    kind: ActionKind,
    component: &str,
    topology: &ComponentProfile,
    reason: &str,
) -> Option<Action> {
    let component = component.to_string();
    let action = match kind {
        RestartService => Action::RestartService { component },
        ClearCache => Action::ClearCache { component },
        QuarantineNode => Action::QuarantineNode { component },
        ReleaseNode => Action::ReleaseNode { component },
        ScaleOut => {
            let to = topology
                .replicas
                .saturating_add(topology.scale_step.max(1))
                .min(topology.max_replicas);
            if to <= topology.replicas {
                return None;
            }
            Action::ScaleOut {
                component,
                from_replicas: topology.replicas,
                to_replicas: to,
            }
        }
        ScaleIn => {
            let to = topology
                .replicas
                .saturating_sub(topology.scale_step.max(1))
                .max(topology.min_replicas);
            if to >= topology.replicas {
                return None;
            }
            Action::ScaleIn {
                component,
                from_replicas: topology.replicas,
                to_replicas: to,
            }
        }
        RerouteTraffic => Action::RerouteTraffic {
            component,
            from: topology.current_route.clone(),
            to: topology.alternate_route.clone()?,
        },
        Failover => Action::Failover {
            from: component.clone(),
            to: topology.standby.clone()?,
            component,
        },
        RollbackConfig => Action::RollbackConfig {
            component,
            from_revision: topology
                .current_revision
                .clone()
                .unwrap_or_else(|| "current".to_string()),
            to_revision: topology.previous_revision.clone()?,
        },
        Escalate => Action::Escalate {
            component,
            reason: reason.to_string(),
        },
    };
    Some(action)
}
