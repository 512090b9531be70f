//! The cycle driver.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::approvals::{ApprovalQueue, ParkResult};
use super::{CycleError, CyclePhase, CycleSummary, LoopControl, LoopStatus};
use crate::analyzer::{AnalysisHistory, Analyzer, RootCause};
use crate::config::{ConfigWatcher, HealConfig};
use crate::executor::{
    ActionStatus, EnforcementBackend, ExecutionReport, ExecutionStatus, Executor, PolicyExecution,
};
use crate::knowledge::{KnowledgeHandle, Outcome, PolicyOutcome, RecordStatus};
use crate::metrics::HealMetrics;
use crate::monitor::{AlertInbox, Monitor, TelemetrySource};
use crate::planner::{Action, Planner, RemediationPolicy};
use crate::storage::ExecutionLog;

/// Owns every phase and drives them in order, one cycle at a time.
pub struct Orchestrator {
    watcher: ConfigWatcher,
    config: Arc<HealConfig>,
    monitor: Monitor,
    analyzer: Analyzer,
    planner: Planner,
    executor: Executor,
    knowledge: KnowledgeHandle,
    history: AnalysisHistory,
    approvals: ApprovalQueue,
    executions: ExecutionLog,
    metrics: HealMetrics,
    status: watch::Sender<LoopStatus>,
    reports_tx: mpsc::UnboundedSender<ExecutionReport>,
    reports_rx: mpsc::UnboundedReceiver<ExecutionReport>,
    /// Finished executions not yet learned from, in completion order.
    unlearned: VecDeque<ExecutionReport>,
    cycle: u64,
}

impl Orchestrator {
    pub fn new(
        watcher: ConfigWatcher,
        telemetry: Arc<dyn TelemetrySource>,
        backend: Arc<dyn EnforcementBackend>,
        knowledge: KnowledgeHandle,
        executions: ExecutionLog,
        metrics: HealMetrics,
    ) -> Self {
        let config = watcher.current();
        let (status, _) = watch::channel(LoopStatus::default());
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        Self {
            monitor: Monitor::new(config.monitor.clone(), telemetry),
            analyzer: Analyzer::new(config.analyzer.clone()),
            planner: Planner::new(config.planner.clone()),
            executor: Executor::new(config.executor.clone(), backend),
            history: AnalysisHistory::new(config.analyzer.history_cycles),
            approvals: ApprovalQueue::new(
                config.cycle.max_pending_approvals,
                config.cycle.approval_ttl_cycles,
            ),
            watcher,
            config,
            knowledge,
            executions,
            metrics,
            status,
            reports_tx,
            reports_rx,
            unlearned: VecDeque::new(),
            cycle: 0,
        }
    }

    /// Merge alerts pushed through `inbox` into every collection.
    pub fn with_alerts(mut self, inbox: AlertInbox) -> Self {
        self.monitor = self.monitor.with_alerts(inbox);
        self
    }

    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    pub fn approvals(&self) -> ApprovalQueue {
        self.approvals.clone()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn history(&self) -> &AnalysisHistory {
        &self.history
    }

    /// Run cycles until `control` says stop.
    pub async fn run(mut self, control: LoopControl) {
        let mut interval_sec = self.config.cycle.interval_sec;
        let mut ticker = ticker(interval_sec);
        self.status.send_modify(|s| s.running = true);
        info!(interval_sec, "control loop started");

        loop {
            tokio::select! {
                biased;
                _ = control.shutdown_token().cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.reload().await;
            if self.config.cycle.interval_sec != interval_sec {
                interval_sec = self.config.cycle.interval_sec;
                ticker = ticker_after(interval_sec);
                info!(interval_sec, "cycle interval changed");
            }

            self.run_cycle(control.cancel_token()).await;
        }

        self.status.send_modify(|s| {
            s.running = false;
            s.phase = CyclePhase::Idle;
        });
        info!(cycles = self.cycle, "control loop stopped");
    }

    /// Swap in a changed configuration file. Never called mid-cycle.
    pub async fn reload(&mut self) {
        let Some(config) = self.watcher.refresh() else {
            return;
        };
        self.monitor.reconfigure(config.monitor.clone());
        self.analyzer.reconfigure(config.analyzer.clone());
        self.planner.reconfigure(config.planner.clone());
        self.executor.reconfigure(config.executor.clone()).await;
        self.history.set_capacity(config.analyzer.history_cycles);
        self.approvals
            .resize(config.cycle.max_pending_approvals, config.cycle.approval_ttl_cycles)
            .await;
        if let Err(e) = self.knowledge.reconfigure(&config.knowledge).await {
            warn!(error = %e, "could not apply knowledge settings");
        }
        self.config = config;
    }

    /// One full MAPE-K cycle. Failures abandon the cycle and are reported
    /// in the summary; they never escape.
    pub async fn run_cycle(&mut self, parent: &CancellationToken) -> CycleSummary {
        self.cycle += 1;
        let cycle = self.cycle;
        let token = parent.child_token();
        let started = Instant::now();
        let mut summary = CycleSummary {
            cycle,
            started_at: Utc::now(),
            ..CycleSummary::default()
        };

        debug!(cycle, "cycle started");
        let result = self.phases(cycle, &token, &mut summary).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.metrics.record_cycle("completed", elapsed);
                debug!(cycle, elapsed_sec = elapsed, "cycle completed");
            }
            Err(e) => {
                // Outstanding phase I/O stops; applied actions still compensate.
                token.cancel();
                self.metrics.record_cycle_failure(e.phase());
                self.metrics.record_cycle("abandoned", elapsed);
                warn!(cycle, phase = %e.phase(), error = %e, "cycle abandoned");
                summary.error = Some(e.to_string());
            }
        }

        summary.finished_at = Some(Utc::now());
        let pending = self.approvals.len().await;
        self.metrics.pending_approvals.set(pending as i64);
        let published = summary.clone();
        self.status.send_modify(|s| {
            s.phase = CyclePhase::Idle;
            s.pending_approvals = pending;
            s.degraded = published.degraded;
            s.last_cycle = Some(published);
        });
        summary
    }

    async fn phases(
        &mut self,
        cycle: u64,
        token: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> Result<(), CycleError> {
        let timeouts = self.config.cycle.clone();
        let metrics = self.metrics.clone();

        // MONITORING
        self.enter(CyclePhase::Monitoring, cycle);
        let factors = if self.config.knowledge.thresholds.enabled {
            self.knowledge.snapshot().threshold_factors().clone()
        } else {
            BTreeMap::new()
        };
        self.monitor.tune(factors);
        let report = timed(
            &metrics,
            CyclePhase::Monitoring,
            timeouts.phase_timeout(CyclePhase::Monitoring),
            token,
            self.monitor.collect(token),
        )
        .await?;
        summary.violations = report.violations.len();
        summary.dropped = report.dropped;
        summary.degraded = report.degraded;
        self.metrics
            .violations_detected_total
            .inc_by(report.violations.len() as u64);
        self.metrics.monitor_degraded.set(i64::from(report.degraded));

        // ANALYZING
        self.enter(CyclePhase::Analyzing, cycle);
        let snapshot = self.knowledge.snapshot();
        let analysis = {
            let analyzer = &self.analyzer;
            let history = &self.history;
            let violations = &report.violations;
            let snapshot = &snapshot;
            timed(
                &metrics,
                CyclePhase::Analyzing,
                timeouts.phase_timeout(CyclePhase::Analyzing),
                token,
                async move { analyzer.analyze(cycle, violations, history, snapshot, Utc::now()) },
            )
            .await
        };
        // Violations join the history even when analysis was abandoned.
        self.history.push_cycle(cycle, report.violations);
        self.history
            .expire_ledger(cycle, self.config.analyzer.suppression_cycles);
        let analysis = analysis?;
        summary.hypotheses = analysis.hypotheses.len();

        // PLANNING
        self.enter(CyclePhase::Planning, cycle);
        let planner = &self.planner;
        let approvals = &self.approvals;
        let (planned, parked, to_run) = timed(
            &metrics,
            CyclePhase::Planning,
            timeouts.phase_timeout(CyclePhase::Planning),
            token,
            async {
                let planned = planner.plan(&analysis, &snapshot);
                let count = planned.len();
                let (mut to_run, to_park) = select_for_execution(planned);

                approvals.expire(cycle).await;
                let mut parked = 0;
                for policy in to_park {
                    if approvals.park(policy, cycle).await == ParkResult::Parked {
                        parked += 1;
                    }
                }
                // Approvals are handed out last so nothing can abandon them.
                to_run.extend(approvals.take_approved().await);
                (count, parked, to_run)
            },
        )
        .await?;
        summary.policies_planned = planned;
        summary.parked_for_approval = parked;

        // EXECUTING
        self.enter(CyclePhase::Executing, cycle);
        summary.policies_started = to_run.len();
        if !to_run.is_empty() {
            let handles =
                self.executor
                    .spawn_all(to_run, cycle, token.clone(), self.reports_tx.clone());
            let joined = timed(
                &metrics,
                CyclePhase::Executing,
                timeouts.phase_timeout(CyclePhase::Executing),
                token,
                futures::future::join_all(handles),
            )
            .await?;
            for result in joined {
                if let Err(e) = result {
                    error!(cycle, error = %e, "execution task panicked");
                }
            }
        }

        // LEARNING
        self.enter(CyclePhase::Learning, cycle);
        let learned = timed(
            &metrics,
            CyclePhase::Learning,
            timeouts.phase_timeout(CyclePhase::Learning),
            token,
            self.learn(cycle, token),
        )
        .await?;
        summary.outcomes_recorded = learned;
        let snapshot = self.knowledge.snapshot();
        self.metrics.update_confidence(&snapshot);
        self.metrics.update_thresholds(&snapshot);
        Ok(())
    }

    /// Record every finished execution, in completion order, including
    /// ones left over from abandoned cycles.
    async fn learn(&mut self, cycle: u64, token: &CancellationToken) -> usize {
        while let Ok(report) = self.reports_rx.try_recv() {
            self.unlearned.push_back(report);
        }

        let mut recorded = 0;
        while let Some(report) = self.unlearned.front().cloned() {
            match report {
                ExecutionReport::Deferred(deferred) => {
                    let reason = deferred.reason.as_str();
                    if self.approvals.requeue(deferred.policy.id, cycle).await {
                        debug!(policy_id = %deferred.policy.id, reason, "approval kept for a later cycle");
                    } else {
                        info!(
                            policy_id = %deferred.policy.id,
                            component = %deferred.policy.component,
                            reason,
                            "policy deferred, it will be re-planned"
                        );
                    }
                    self.metrics.record_deferred(reason);
                }
                ExecutionReport::Finished(exec) => {
                    self.approvals.settle(exec.policy_id).await;
                    if self.learn_from(exec, cycle, token).await {
                        recorded += 1;
                    }
                }
            }
            self.unlearned.pop_front();
        }
        recorded
    }

    async fn learn_from(&mut self, exec: PolicyExecution, cycle: u64, token: &CancellationToken) -> bool {
        let (outcome, delta) = match exec.status {
            ExecutionStatus::RolledBack => (Outcome::RolledBack, None),
            ExecutionStatus::Failed => (Outcome::Failure, None),
            ExecutionStatus::Succeeded => {
                let before = exec.signals.len();
                match self.monitor.resample(&exec.component, &exec.signals, token).await {
                    Some(after) => {
                        let outcome = judge(before, after);
                        (outcome, Some(before as f64 - after as f64))
                    }
                    None => {
                        info!(
                            execution_id = %exec.id,
                            component = %exec.component,
                            "post-remediation state could not be checked"
                        );
                        (Outcome::Unverified, None)
                    }
                }
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                warn!(execution_id = %exec.id, status = %exec.status, "non-terminal execution reported");
                return false;
            }
        };

        if outcome == Outcome::NoOp {
            self.history
                .mark_ineffective(exec.root_cause, &exec.component, cycle);
        }

        self.remember_replicas(&exec).await;

        let mttr = exec.mttr_sec();
        let signals = exec.signals.clone();
        let record = PolicyOutcome::from_execution(&exec, outcome, delta, mttr);
        let fresh = match self.knowledge.record(record).await {
            Ok(RecordStatus::Recorded) => true,
            Ok(RecordStatus::Duplicate) => false,
            Err(e) => {
                error!(execution_id = %exec.id, error = %e, "outcome not recorded");
                false
            }
        };

        let log = self.executions.clone();
        let id = exec.id;
        let component = exec.component.clone();
        match tokio::task::spawn_blocking(move || log.record(&exec)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(execution_id = %id, error = %format!("{e:#}"), "execution not persisted"),
            Err(e) => warn!(execution_id = %id, error = %e, "execution writer panicked"),
        }

        if fresh && self.config.knowledge.thresholds.enabled {
            match self.knowledge.tune_thresholds(signals, outcome, mttr).await {
                Ok(changed) if !changed.is_empty() => {
                    debug!(execution_id = %id, adjusted = changed.len(), "thresholds adjusted");
                }
                Ok(_) => {}
                Err(e) => warn!(execution_id = %id, error = %e, "threshold feedback not applied"),
            }
        }

        if fresh {
            self.metrics.record_outcome(outcome, mttr);
            info!(
                execution_id = %id,
                component = %component,
                outcome = %outcome,
                mttr_sec = mttr.unwrap_or_default(),
                "remediation outcome learned"
            );
        }
        fresh
    }

    /// Scale steps that stayed applied leave the component at a new size.
    async fn remember_replicas(&self, exec: &PolicyExecution) {
        for step in exec.steps.iter().filter(|s| s.status == ActionStatus::Succeeded) {
            let (component, replicas) = match &step.action {
                Action::ScaleOut {
                    component,
                    to_replicas,
                    ..
                }
                | Action::ScaleIn {
                    component,
                    to_replicas,
                    ..
                } => (component, *to_replicas),
                _ => continue,
            };
            if let Err(e) = self.knowledge.record_replicas(component, replicas).await {
                warn!(component = %component, error = %e, "replica count not recorded");
            }
        }
    }

    fn enter(&self, phase: CyclePhase, cycle: u64) {
        debug!(cycle, phase = %phase, "entering phase");
        self.status.send_modify(|s| {
            s.phase = phase;
            s.cycle = cycle;
        });
    }
}

/// Success when the violations cleared, partial when they dropped, no-op
/// otherwise.
fn judge(before: usize, after: usize) -> Outcome {
    if after == 0 {
        Outcome::Success
    } else if after < before {
        Outcome::Partial
    } else {
        Outcome::NoOp
    }
}

/// Best autonomous candidate per (root cause, component); groups without
/// one park their best approval-required candidate instead.
fn select_for_execution(
    policies: Vec<RemediationPolicy>,
) -> (Vec<RemediationPolicy>, Vec<RemediationPolicy>) {
    let mut autonomous: HashSet<(RootCause, String)> = HashSet::new();
    for p in policies.iter().filter(|p| !p.approval_required) {
        autonomous.insert((p.root_cause, p.component.clone()));
    }

    let mut seen = HashSet::new();
    let mut run = Vec::new();
    let mut park = Vec::new();
    for policy in policies {
        let key = (policy.root_cause, policy.component.clone());
        if autonomous.contains(&key) {
            if !policy.approval_required && seen.insert(key) {
                run.push(policy);
            }
        } else if seen.insert(key) {
            park.push(policy);
        }
    }
    (run, park)
}

async fn bounded<T>(
    phase: CyclePhase,
    limit: Duration,
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, CycleError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CycleError::Cancelled { phase }),
        result = tokio::time::timeout(limit, fut) => {
            result.map_err(|_| CycleError::PhaseTimeout { phase, limit })
        }
    }
}

/// [`bounded`], observing the phase's wall time whether or not it finished.
async fn timed<T>(
    metrics: &HealMetrics,
    phase: CyclePhase,
    limit: Duration,
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, CycleError> {
    let started = Instant::now();
    let result = bounded(phase, limit, cancel, fut).await;
    metrics.record_phase(phase, started.elapsed().as_secs_f64());
    result
}

fn ticker(interval_sec: u64) -> Interval {
    let mut t = tokio::time::interval(Duration::from_secs(interval_sec.max(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

fn ticker_after(interval_sec: u64) -> Interval {
    let period = Duration::from_secs(interval_sec.max(1));
    let mut t = tokio::time::interval_at(Instant::now() + period, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::Confidence;
    use crate::planner::{Action, PlannedAction};
    use uuid::Uuid;

    fn policy(rc: RootCause, component: &str, approval: bool, score: f64) -> RemediationPolicy {
        RemediationPolicy {
            id: Uuid::new_v4(),
            root_cause: rc,
            component: component.into(),
            actions: vec![PlannedAction::new(Action::RestartService {
                component: component.into(),
            })],
            estimated_cost: 1.0,
            estimated_benefit: score,
            blast_radius: 0.3,
            confidence: Confidence::Unknown,
            approval_required: approval,
            approval_reason: None,
            hypothesis_confidence: 0.5,
            signals: vec![],
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_judge() {
        assert_eq!(judge(3, 0), Outcome::Success);
        assert_eq!(judge(3, 1), Outcome::Partial);
        assert_eq!(judge(3, 3), Outcome::NoOp);
        assert_eq!(judge(0, 0), Outcome::Success);
    }

    #[test]
    fn test_selection_prefers_autonomous_candidate() {
        let rc = RootCause::ResourceExhaustion;
        let policies = vec![
            policy(rc, "web", true, 0.9),
            policy(rc, "web", false, 0.8),
            policy(rc, "web", false, 0.7),
            policy(RootCause::NetworkPartition, "db", true, 0.6),
            policy(RootCause::NetworkPartition, "db", true, 0.5),
        ];
        let (run, park) = select_for_execution(policies);
        assert_eq!(run.len(), 1);
        assert_eq!(run[0].estimated_benefit, 0.8);
        assert_eq!(park.len(), 1);
        assert_eq!(park[0].component, "db");
        assert_eq!(park[0].estimated_benefit, 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let token = CancellationToken::new();
        let result = bounded(
            CyclePhase::Executing,
            Duration::from_secs(1),
            &token,
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(matches!(result, Err(CycleError::PhaseTimeout { phase: CyclePhase::Executing, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_records_failed_phases() {
        let metrics = HealMetrics::new().unwrap();
        let token = CancellationToken::new();
        let ok = timed(&metrics, CyclePhase::Planning, Duration::from_secs(1), &token, async { 7 }).await;
        assert_eq!(ok, Ok(7));
        let late = timed(
            &metrics,
            CyclePhase::Learning,
            Duration::from_secs(1),
            &token,
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert!(late.is_err());

        let text = metrics.export().unwrap();
        assert!(text.contains("autoheal_phase_duration_seconds_count{phase=\"plan\"} 1"));
        assert!(text.contains("autoheal_phase_duration_seconds_count{phase=\"learn\"} 1"));
    }

    #[tokio::test]
    async fn test_bounded_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = bounded(CyclePhase::Monitoring, Duration::from_secs(1), &token, async { 1 }).await;
        assert_eq!(result, Err(CycleError::Cancelled { phase: CyclePhase::Monitoring }));
    }
}
