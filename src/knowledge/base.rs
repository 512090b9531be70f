use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{OutcomeStore, PairKey};
use super::{
    Confidence, KnowledgeError, KnowledgeSnapshot, LearningInsight, Outcome, PairStats,
    PolicyOutcome, ThresholdFeedback,
};
use crate::analyzer::RootCause;
use crate::config::{KnowledgeConfig, ThresholdTuning};
use crate::planner::ActionKind;
use crate::storage::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Recorded,
    /// The execution id was already in the log; nothing changed.
    Duplicate,
}

enum KnowledgeCommand {
    Record {
        outcome: PolicyOutcome,
        reply: oneshot::Sender<Result<RecordStatus, KnowledgeError>>,
    },
    ResetPair {
        key: PairKey,
        reply: oneshot::Sender<Result<PairStats, KnowledgeError>>,
    },
    TuneThresholds {
        signals: Vec<String>,
        outcome: Outcome,
        mttr_sec: Option<f64>,
        reply: oneshot::Sender<Result<BTreeMap<String, f64>, KnowledgeError>>,
    },
    SetReplicas {
        component: String,
        replicas: u32,
        reply: oneshot::Sender<Result<(), KnowledgeError>>,
    },
    Reconfigure {
        min_sample_size: u64,
        tuning: ThresholdTuning,
    },
}

/// The single writer of the aggregate table.
pub struct KnowledgeBase {
    store: OutcomeStore,
    pairs: BTreeMap<PairKey, PairStats>,
    recorded: HashSet<Uuid>,
    thresholds: BTreeMap<String, f64>,
    replicas: BTreeMap<String, u32>,
    min_sample_size: u64,
    tuning: ThresholdTuning,
    version: u64,
    publish: watch::Sender<Arc<KnowledgeSnapshot>>,
}

impl KnowledgeBase {
    /// Load the log, cross-check the persisted aggregates and start the
    /// writer task.
    pub async fn open(
        pool: Pool,
        config: &KnowledgeConfig,
    ) -> anyhow::Result<(KnowledgeHandle, JoinHandle<()>)> {
        let store = OutcomeStore::new(pool);

        let loader = store.clone();
        let (scan, persisted, thresholds, replicas) = tokio::task::spawn_blocking(move || {
            let scan = loader.scan_log()?;
            let persisted = loader.load_aggregates()?;
            let thresholds = loader.load_thresholds()?;
            let replicas = loader.load_replicas()?;
            anyhow::Ok((scan, persisted, thresholds, replicas))
        })
        .await
        .context("knowledge loader panicked")??;

        let mut pairs = scan.pairs;
        let mut keys: HashSet<PairKey> = pairs.keys().copied().collect();
        keys.extend(persisted.keys().copied());
        keys.extend(scan.unreadable.iter().copied());

        for key in keys {
            let derived = pairs.get(&key).copied().unwrap_or_default();
            let consistent = !scan.unreadable.contains(&key)
                && match persisted.get(&key) {
                    Some(Some(stored)) => stored.same_counts(&derived),
                    Some(None) => false,
                    None => derived.same_counts(&PairStats::default()),
                };
            if !consistent {
                warn!(
                    root_cause = %key.0,
                    action = %key.1,
                    "aggregate disagrees with outcome log, confidence unknown until reset"
                );
                pairs.entry(key).or_default().corrupted = true;
            }
        }

        let min_sample_size = config.min_sample_size.max(1);
        let snapshot = KnowledgeSnapshot::from_parts(
            pairs.clone(),
            thresholds.clone(),
            replicas.clone(),
            min_sample_size,
            0,
        );
        let (publish, snapshots) = watch::channel(Arc::new(snapshot));
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));

        info!(
            pairs = pairs.len(),
            outcomes = scan.recorded.len(),
            tuned_signals = thresholds.len(),
            "knowledge base loaded"
        );

        let writer = KnowledgeBase {
            store,
            pairs,
            recorded: scan.recorded,
            thresholds,
            replicas,
            min_sample_size,
            tuning: config.thresholds.clone(),
            version: 0,
            publish,
        };
        let task = tokio::spawn(writer.run(rx));

        Ok((KnowledgeHandle { tx, snapshots }, task))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<KnowledgeCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                KnowledgeCommand::Record { outcome, reply } => {
                    let result = self.record(outcome).await;
                    let _ = reply.send(result);
                }
                KnowledgeCommand::ResetPair { key, reply } => {
                    let result = self.reset(key).await;
                    let _ = reply.send(result);
                }
                KnowledgeCommand::TuneThresholds {
                    signals,
                    outcome,
                    mttr_sec,
                    reply,
                } => {
                    let result = self.tune(signals, outcome, mttr_sec).await;
                    let _ = reply.send(result);
                }
                KnowledgeCommand::SetReplicas {
                    component,
                    replicas,
                    reply,
                } => {
                    let result = self.set_replicas(component, replicas).await;
                    let _ = reply.send(result);
                }
                KnowledgeCommand::Reconfigure {
                    min_sample_size,
                    tuning,
                } => {
                    self.tuning = tuning;
                    if min_sample_size.max(1) != self.min_sample_size {
                        self.min_sample_size = min_sample_size.max(1);
                        self.publish_snapshot();
                    }
                }
            }
        }
        debug!("knowledge writer stopped");
    }

    async fn record(&mut self, outcome: PolicyOutcome) -> Result<RecordStatus, KnowledgeError> {
        if self.recorded.contains(&outcome.execution_id) {
            debug!(execution = %outcome.execution_id, "outcome already recorded");
            return Ok(RecordStatus::Duplicate);
        }

        let store = self.store.clone();
        let row = outcome.clone();
        let inserted = tokio::task::spawn_blocking(move || store.append(&row))
            .await
            .context("outcome writer panicked")??;

        self.recorded.insert(outcome.execution_id);
        if !inserted {
            return Ok(RecordStatus::Duplicate);
        }

        self.pairs
            .entry((outcome.root_cause, outcome.action))
            .or_default()
            .apply(outcome.outcome);
        self.publish_snapshot();

        info!(
            execution = %outcome.execution_id,
            root_cause = %outcome.root_cause,
            action = %outcome.action,
            outcome = %outcome.outcome,
            "outcome recorded"
        );
        Ok(RecordStatus::Recorded)
    }

    async fn reset(&mut self, key: PairKey) -> Result<PairStats, KnowledgeError> {
        let store = self.store.clone();
        let stats = tokio::task::spawn_blocking(move || store.rebuild_pair(key))
            .await
            .context("aggregate rebuild panicked")??;

        self.pairs.insert(key, stats);
        self.publish_snapshot();
        info!(root_cause = %key.0, action = %key.1, "aggregate reset from outcome log");
        Ok(stats)
    }

    /// Move each signal's factor one step in the direction `outcome` calls
    /// for. Returns the factors that changed.
    async fn tune(
        &mut self,
        signals: Vec<String>,
        outcome: Outcome,
        mttr_sec: Option<f64>,
    ) -> Result<BTreeMap<String, f64>, KnowledgeError> {
        let feedback = ThresholdFeedback::from_outcome(outcome, mttr_sec, &self.tuning);
        let mut changed = BTreeMap::new();
        for signal in signals {
            let current = self.thresholds.get(&signal).copied().unwrap_or(1.0);
            let next = feedback.apply(current, &self.tuning);
            if (next - current).abs() > f64::EPSILON {
                changed.insert(signal, next);
            }
        }
        if changed.is_empty() {
            return Ok(changed);
        }

        let store = self.store.clone();
        let rows: Vec<(String, f64)> = changed.iter().map(|(s, f)| (s.clone(), *f)).collect();
        tokio::task::spawn_blocking(move || store.save_thresholds(&rows))
            .await
            .context("threshold writer panicked")??;

        for (signal, factor) in &changed {
            info!(signal = %signal, factor, feedback = ?feedback, "threshold factor adjusted");
            self.thresholds.insert(signal.clone(), *factor);
        }
        self.publish_snapshot();
        Ok(changed)
    }

    async fn set_replicas(&mut self, component: String, replicas: u32) -> Result<(), KnowledgeError> {
        if self.replicas.get(&component) == Some(&replicas) {
            return Ok(());
        }
        let store = self.store.clone();
        let name = component.clone();
        tokio::task::spawn_blocking(move || store.save_replicas(&name, replicas))
            .await
            .context("replica writer panicked")??;

        debug!(component = %component, replicas, "replica count recorded");
        self.replicas.insert(component, replicas);
        self.publish_snapshot();
        Ok(())
    }

    fn publish_snapshot(&mut self) {
        self.version += 1;
        let snapshot = KnowledgeSnapshot::from_parts(
            self.pairs.clone(),
            self.thresholds.clone(),
            self.replicas.clone(),
            self.min_sample_size,
            self.version,
        );
        // No receivers only happens during shutdown.
        if self.publish.send(Arc::new(snapshot)).is_err() {
            error!("no knowledge snapshot readers left");
        }
    }
}

/// Cloneable access to the knowledge base.
#[derive(Clone)]
pub struct KnowledgeHandle {
    tx: mpsc::Sender<KnowledgeCommand>,
    snapshots: watch::Receiver<Arc<KnowledgeSnapshot>>,
}

impl KnowledgeHandle {
    /// The last fully committed snapshot. Never waits on the writer.
    pub fn snapshot(&self) -> Arc<KnowledgeSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<KnowledgeSnapshot>> {
        self.snapshots.clone()
    }

    /// Append an outcome. Replays of the same execution id are ignored.
    pub async fn record(&self, outcome: PolicyOutcome) -> Result<RecordStatus, KnowledgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(KnowledgeCommand::Record { outcome, reply })
            .await
            .map_err(|_| KnowledgeError::Closed)?;
        rx.await.map_err(|_| KnowledgeError::Closed)?
    }

    /// Recompute a pair from the log and clear its corruption flag.
    pub async fn reset_pair(
        &self,
        root_cause: RootCause,
        action: ActionKind,
    ) -> Result<PairStats, KnowledgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(KnowledgeCommand::ResetPair {
                key: (root_cause, action),
                reply,
            })
            .await
            .map_err(|_| KnowledgeError::Closed)?;
        rx.await.map_err(|_| KnowledgeError::Closed)?
    }

    /// Apply reloadable settings: the sample floor and threshold tuning.
    pub async fn reconfigure(&self, config: &KnowledgeConfig) -> Result<(), KnowledgeError> {
        self.tx
            .send(KnowledgeCommand::Reconfigure {
                min_sample_size: config.min_sample_size,
                tuning: config.thresholds.clone(),
            })
            .await
            .map_err(|_| KnowledgeError::Closed)
    }

    /// Feed an outcome back into the thresholds of the signals that
    /// triggered it.
    pub async fn tune_thresholds(
        &self,
        signals: Vec<String>,
        outcome: Outcome,
        mttr_sec: Option<f64>,
    ) -> Result<BTreeMap<String, f64>, KnowledgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(KnowledgeCommand::TuneThresholds {
                signals,
                outcome,
                mttr_sec,
                reply,
            })
            .await
            .map_err(|_| KnowledgeError::Closed)?;
        rx.await.map_err(|_| KnowledgeError::Closed)?
    }

    pub async fn record_replicas(&self, component: &str, replicas: u32) -> Result<(), KnowledgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(KnowledgeCommand::SetReplicas {
                component: component.to_string(),
                replicas,
                reply,
            })
            .await
            .map_err(|_| KnowledgeError::Closed)?;
        rx.await.map_err(|_| KnowledgeError::Closed)?
    }

    pub fn query(&self, root_cause: RootCause) -> Option<(ActionKind, Confidence)> {
        self.snapshot().query(root_cause)
    }

    pub fn insights(&self) -> Vec<LearningInsight> {
        self.snapshot().insights()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn outcome(o: Outcome) -> PolicyOutcome {
        PolicyOutcome {
            execution_id: Uuid::new_v4(),
            policy_id: Uuid::new_v4(),
            component: "web-1".into(),
            root_cause: RootCause::ResourceExhaustion,
            action: ActionKind::ScaleOut,
            outcome: o,
            metric_delta: None,
            mttr_sec: None,
            recorded_at: Utc::now(),
        }
    }

    fn config() -> KnowledgeConfig {
        KnowledgeConfig {
            min_sample_size: 2,
            ..KnowledgeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_record_updates_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("kb.db")).unwrap();
        let (kb, _task) = KnowledgeBase::open(pool, &config()).await.unwrap();

        let before = kb.snapshot();
        assert_eq!(
            before.confidence(RootCause::ResourceExhaustion, ActionKind::ScaleOut),
            Confidence::Unknown
        );

        kb.record(outcome(Outcome::Success)).await.unwrap();
        kb.record(outcome(Outcome::Failure)).await.unwrap();

        let after = kb.snapshot();
        assert!(after.version > before.version);
        assert_eq!(
            after.confidence(RootCause::ResourceExhaustion, ActionKind::ScaleOut),
            Confidence::Known(0.5)
        );
        // The old snapshot is untouched.
        assert_eq!(before.insights().len(), 0);
    }

    #[tokio::test]
    async fn test_replay_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("kb.db")).unwrap();
        let (kb, _task) = KnowledgeBase::open(pool, &config()).await.unwrap();

        let o = outcome(Outcome::Success);
        assert_eq!(kb.record(o.clone()).await.unwrap(), RecordStatus::Recorded);
        assert_eq!(kb.record(o).await.unwrap(), RecordStatus::Duplicate);

        let stats = *kb
            .snapshot()
            .stats(RootCause::ResourceExhaustion, ActionKind::ScaleOut)
            .unwrap();
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test]
    async fn test_reopen_restores_and_detects_tampering() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kb.db");
        {
            let pool = crate::storage::open_pool(&path).unwrap();
            let (kb, _task) = KnowledgeBase::open(pool, &config()).await.unwrap();
            kb.record(outcome(Outcome::Success)).await.unwrap();
            kb.record(outcome(Outcome::Success)).await.unwrap();
        }

        let pool = crate::storage::open_pool(&path).unwrap();
        let (kb, _task) = KnowledgeBase::open(pool.clone(), &config()).await.unwrap();
        assert_eq!(
            kb.snapshot()
                .confidence(RootCause::ResourceExhaustion, ActionKind::ScaleOut),
            Confidence::Known(1.0)
        );
        drop(kb);

        pool.get()
            .unwrap()
            .execute("UPDATE learning_aggregates SET success_count = 99", [])
            .unwrap();

        let (kb, _task) = KnowledgeBase::open(pool, &config()).await.unwrap();
        let snap = kb.snapshot();
        let stats = snap
            .stats(RootCause::ResourceExhaustion, ActionKind::ScaleOut)
            .unwrap();
        assert!(stats.corrupted);
        assert_eq!(
            snap.confidence(RootCause::ResourceExhaustion, ActionKind::ScaleOut),
            Confidence::Unknown
        );

        let reset = kb
            .reset_pair(RootCause::ResourceExhaustion, ActionKind::ScaleOut)
            .await
            .unwrap();
        assert_eq!(reset.success_count, 2);
        assert!(!reset.corrupted);
        assert_eq!(
            kb.snapshot()
                .confidence(RootCause::ResourceExhaustion, ActionKind::ScaleOut),
            Confidence::Known(1.0)
        );
    }

    #[tokio::test]
    async fn test_feedback_moves_thresholds_and_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kb.db");
        {
            let pool = crate::storage::open_pool(&path).unwrap();
            let (kb, _task) = KnowledgeBase::open(pool, &config()).await.unwrap();

            let changed = kb
                .tune_thresholds(vec!["cpu".into()], Outcome::RolledBack, None)
                .await
                .unwrap();
            assert!((changed["cpu"] - 0.95).abs() < 1e-9);

            // Already at the ceiling; nothing to relax.
            let changed = kb
                .tune_thresholds(vec!["mem".into()], Outcome::Success, Some(5.0))
                .await
                .unwrap();
            assert!(changed.is_empty());
            kb.tune_thresholds(vec!["cpu".into()], Outcome::Success, Some(5.0))
                .await
                .unwrap();

            kb.record_replicas("web-1", 4).await.unwrap();
        }

        let pool = crate::storage::open_pool(&path).unwrap();
        let (kb, _task) = KnowledgeBase::open(pool, &config()).await.unwrap();
        let snap = kb.snapshot();
        assert!((snap.threshold_factor("cpu") - 0.95 * 1.02).abs() < 1e-9);
        assert_eq!(snap.threshold_factor("mem"), 1.0);
        assert_eq!(snap.replicas("web-1"), Some(4));
    }

    #[tokio::test]
    async fn test_reconfigure_changes_floor_and_tuning() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("kb.db")).unwrap();
        let (kb, _task) = KnowledgeBase::open(pool, &config()).await.unwrap();
        kb.record(outcome(Outcome::Success)).await.unwrap();
        assert_eq!(
            kb.snapshot()
                .confidence(RootCause::ResourceExhaustion, ActionKind::ScaleOut),
            Confidence::Unknown
        );

        let mut cfg = config();
        cfg.min_sample_size = 1;
        cfg.thresholds.tighten_step = 0.5;
        kb.reconfigure(&cfg).await.unwrap();

        // Commands are handled in order, so the reply implies the reload.
        let changed = kb
            .tune_thresholds(vec!["cpu".into()], Outcome::Failure, None)
            .await
            .unwrap();
        assert!((changed["cpu"] - 0.5).abs() < 1e-9);
        assert_eq!(
            kb.snapshot()
                .confidence(RootCause::ResourceExhaustion, ActionKind::ScaleOut),
            Confidence::Known(1.0)
        );
    }
}
