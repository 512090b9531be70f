//! Approval-required policies waiting for an operator.
//!
//! The queue is bounded and every entry expires after a number of cycles.
//! Approved policies are handed to the next EXECUTING phase. One the
//! executor defers goes back to the approved set under its original id.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::planner::RemediationPolicy;

#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub policy: RemediationPolicy,
    pub parked_cycle: u64,
    pub parked_at: DateTime<Utc>,
    /// Last cycle in which the entry can still be approved.
    pub expires_after_cycle: u64,
}

impl PendingApproval {
    pub fn id(&self) -> Uuid {
        self.policy.id
    }
}

/// An approved policy that has not finished running yet.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovedPolicy {
    pub policy: RemediationPolicy,
    pub approved_at: DateTime<Utc>,
    /// Times the executor sent it back without running it.
    pub deferrals: u32,
    /// Set by the first deferral; an approval waiting for its first run
    /// never expires.
    pub expires_after_cycle: Option<u64>,
}

fn same_remediation(a: &RemediationPolicy, b: &RemediationPolicy) -> bool {
    a.component == b.component && a.root_cause == b.root_cause && a.action_kinds() == b.action_kinds()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    Parked,
    /// An equivalent policy is already waiting.
    AlreadyPending,
    Full,
}

struct Inner {
    pending: VecDeque<PendingApproval>,
    approved: Vec<ApprovedPolicy>,
    /// Handed to the executor, outcome not yet known.
    launched: HashMap<Uuid, ApprovedPolicy>,
    capacity: usize,
    ttl_cycles: u64,
}

/// Shared between the orchestrator and the API.
#[derive(Clone)]
pub struct ApprovalQueue {
    inner: Arc<RwLock<Inner>>,
}

impl ApprovalQueue {
    pub fn new(capacity: usize, ttl_cycles: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                pending: VecDeque::new(),
                approved: Vec::new(),
                launched: HashMap::new(),
                capacity,
                ttl_cycles,
            })),
        }
    }

    /// Applies to entries parked from now on.
    pub async fn resize(&self, capacity: usize, ttl_cycles: u64) {
        let mut inner = self.inner.write().await;
        inner.capacity = capacity;
        inner.ttl_cycles = ttl_cycles;
    }

    pub async fn park(&self, policy: RemediationPolicy, cycle: u64) -> ParkResult {
        let mut inner = self.inner.write().await;
        // Approved entries still block re-parking until they have run.
        if inner.pending.iter().any(|p| same_remediation(&p.policy, &policy))
            || inner.approved.iter().any(|a| same_remediation(&a.policy, &policy))
            || inner.launched.values().any(|a| same_remediation(&a.policy, &policy))
        {
            return ParkResult::AlreadyPending;
        }
        if inner.pending.len() >= inner.capacity {
            debug!(policy_id = %policy.id, "approval queue full");
            return ParkResult::Full;
        }
        info!(
            policy_id = %policy.id,
            component = %policy.component,
            action = %policy.primary_action(),
            reason = policy.approval_reason.as_deref().unwrap_or(""),
            "policy awaiting approval"
        );
        let expires_after_cycle = cycle.saturating_add(inner.ttl_cycles);
        inner.pending.push_back(PendingApproval {
            policy,
            parked_cycle: cycle,
            parked_at: Utc::now(),
            expires_after_cycle,
        });
        ParkResult::Parked
    }

    pub async fn list(&self) -> Vec<PendingApproval> {
        self.inner.read().await.pending.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Move a pending policy to the approved set.
    pub async fn approve(&self, id: Uuid) -> Option<PendingApproval> {
        let mut inner = self.inner.write().await;
        let pos = inner.pending.iter().position(|p| p.id() == id)?;
        let entry = inner.pending.remove(pos)?;
        info!(policy_id = %id, component = %entry.policy.component, "policy approved");
        inner.approved.push(ApprovedPolicy {
            policy: entry.policy.clone(),
            approved_at: Utc::now(),
            deferrals: 0,
            expires_after_cycle: None,
        });
        Some(entry)
    }

    pub async fn reject(&self, id: Uuid) -> Option<PendingApproval> {
        let mut inner = self.inner.write().await;
        let pos = inner.pending.iter().position(|p| p.id() == id)?;
        let entry = inner.pending.remove(pos)?;
        info!(policy_id = %id, component = %entry.policy.component, "policy rejected");
        Some(entry)
    }

    /// Approved policies waiting for a run, in approval order.
    pub async fn approved(&self) -> Vec<ApprovedPolicy> {
        self.inner.read().await.approved.clone()
    }

    /// Hand every approved policy to the executor. Each stays tracked until
    /// [`settle`](Self::settle) or [`requeue`](Self::requeue) names it.
    pub async fn take_approved(&self) -> Vec<RemediationPolicy> {
        let mut inner = self.inner.write().await;
        let approved = std::mem::take(&mut inner.approved);
        approved
            .into_iter()
            .map(|a| {
                let policy = a.policy.clone();
                inner.launched.insert(policy.id, a);
                policy
            })
            .collect()
    }

    /// The executor deferred `policy_id`; keep its approval for a later
    /// cycle. False when the policy never came from this queue.
    pub async fn requeue(&self, policy_id: Uuid, cycle: u64) -> bool {
        let mut inner = self.inner.write().await;
        let Some(mut entry) = inner.launched.remove(&policy_id) else {
            return false;
        };
        entry.deferrals += 1;
        let ttl = inner.ttl_cycles;
        let expires = *entry
            .expires_after_cycle
            .get_or_insert(cycle.saturating_add(ttl));
        info!(
            policy_id = %policy_id,
            component = %entry.policy.component,
            deferrals = entry.deferrals,
            expires_after_cycle = expires,
            "approved policy deferred, kept for a later cycle"
        );
        inner.approved.push(entry);
        true
    }

    /// The approved policy ran to a terminal state.
    pub async fn settle(&self, policy_id: Uuid) -> bool {
        self.inner.write().await.launched.remove(&policy_id).is_some()
    }

    /// Drop pending entries, and deferred approvals, whose time ran out
    /// before `cycle`.
    pub async fn expire(&self, cycle: u64) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.pending.len() + inner.approved.len();
        inner.pending.retain(|p| {
            let keep = cycle <= p.expires_after_cycle;
            if !keep {
                info!(policy_id = %p.id(), component = %p.policy.component, "approval expired");
            }
            keep
        });
        inner.approved.retain(|a| {
            let keep = a.expires_after_cycle.map_or(true, |last| cycle <= last);
            if !keep {
                info!(
                    policy_id = %a.policy.id,
                    component = %a.policy.component,
                    deferrals = a.deferrals,
                    "deferred approval expired"
                );
            }
            keep
        });
        before - inner.pending.len() - inner.approved.len()
    }
}
