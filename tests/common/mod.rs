//! Scripted telemetry and enforcement doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autoheal::config::{HealConfig, RetryConfig, SignalConfig};
use autoheal::executor::{
    CharterRequest, CharterStatus, EnforcementBackend, EnforcementError, RollbackOutcome,
};
use autoheal::monitor::{Sample, TelemetryError, TelemetryQuery, TelemetrySource};
use autoheal::planner::{Action, ActionKind, Compensation};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// In-memory series keyed by signal. Points are spaced one second apart,
/// the last one stamped "now".
#[derive(Default)]
pub struct ScriptedTelemetry {
    series: Mutex<HashMap<String, Vec<(String, f64)>>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    queries: AtomicUsize,
}

impl ScriptedTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace `component`'s points on `signal` with `n` copies of `value`.
    pub fn burst(&self, signal: &str, component: &str, value: f64, n: usize) {
        let mut series = self.series.lock().unwrap();
        let points = series.entry(signal.to_string()).or_default();
        points.retain(|(c, _)| c != component);
        points.extend(std::iter::repeat((component.to_string(), value)).take(n));
    }

    pub fn set(&self, signal: &str, component: &str, value: f64) {
        self.burst(signal, component, value, 1);
    }

    /// Every signal on `component` drops to zero.
    pub fn heal(&self, component: &str) {
        let mut series = self.series.lock().unwrap();
        for points in series.values_mut() {
            if points.iter().any(|(c, _)| c == component) {
                points.retain(|(c, _)| c != component);
                points.push((component.to_string(), 0.0));
            }
        }
    }

    pub fn fail(&self, signal: &str) {
        self.failing.lock().unwrap().insert(signal.to_string());
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TelemetrySource for ScriptedTelemetry {
    async fn query(
        &self,
        query: &TelemetryQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>, TelemetryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TelemetryError::Unreachable("cancelled".into())),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.failing.lock().unwrap().contains(&query.signal) {
            return Err(TelemetryError::Unreachable(format!("{} is down", query.signal)));
        }

        let wanted = query.selectors.get("component");
        let points = self
            .series
            .lock()
            .unwrap()
            .get(&query.signal)
            .cloned()
            .unwrap_or_default();
        let now = Utc::now();
        let n = points.len() as i64;

        Ok(points
            .into_iter()
            .enumerate()
            .filter(|(_, (c, _))| wanted.map_or(true, |w| w == c))
            .map(|(i, (component, value))| Sample {
                component,
                value,
                timestamp: now - chrono::Duration::seconds(n - 1 - i as i64),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Enforcement
// ---------------------------------------------------------------------------

struct Charter {
    step: usize,
    action: Action,
    compensation: Compensation,
}

#[derive(Default)]
struct BackendState {
    next: u64,
    charters: HashMap<String, Charter>,
    calls: Vec<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Records every call as `op:step:kind`; rollbacks carry the kind of the
/// compensating action. Behaviour per action kind is scripted up front.
#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<BackendState>,
    reject: HashSet<ActionKind>,
    never_enforce: HashSet<ActionKind>,
    irreversible: HashSet<ActionKind>,
    apply_delay: Duration,
    heals: Option<Arc<ScriptedTelemetry>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, kind: ActionKind) -> Self {
        self.reject.insert(kind);
        self
    }

    pub fn never_enforcing(mut self, kind: ActionKind) -> Self {
        self.never_enforce.insert(kind);
        self
    }

    pub fn irreversible(mut self, kind: ActionKind) -> Self {
        self.irreversible.insert(kind);
        self
    }

    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// A successful apply clears the component's signals in `telemetry`.
    pub fn healing(mut self, telemetry: Arc<ScriptedTelemetry>) -> Self {
        self.heals = Some(telemetry);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(op))
            .collect()
    }

    /// Highest number of applies seen in flight at once on `component`.
    pub fn max_in_flight(&self, component: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_in_flight
            .get(component)
            .copied()
            .unwrap_or(0)
    }

    fn charter(&self, id: &str) -> Result<(usize, Action), EnforcementError> {
        self.state
            .lock()
            .unwrap()
            .charters
            .get(id)
            .map(|c| (c.step, c.action.clone()))
            .ok_or_else(|| EnforcementError::NotFound(id.to_string()))
    }

    fn compensation(&self, id: &str) -> Option<Compensation> {
        self.state
            .lock()
            .unwrap()
            .charters
            .get(id)
            .map(|c| c.compensation.clone())
    }

    fn log(&self, op: &str, step: usize, kind: ActionKind) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("{op}:{step}:{kind}"));
    }
}

#[async_trait::async_trait]
impl EnforcementBackend for ScriptedBackend {
    async fn create_policy(
        &self,
        request: &CharterRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, EnforcementError> {
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        let id = format!("charter-{}", state.next);
        state.charters.insert(
            id.clone(),
            Charter {
                step: request.step,
                action: request.action.clone(),
                compensation: request.compensation.clone(),
            },
        );
        state
            .calls
            .push(format!("create:{}:{}", request.step, request.action.kind()));
        Ok(id)
    }

    async fn apply_policy(&self, id: &str, _cancel: &CancellationToken) -> Result<(), EnforcementError> {
        let (step, action) = self.charter(id)?;
        let component = action.component().to_string();
        self.log("apply", step, action.kind());

        {
            let mut state = self.state.lock().unwrap();
            let now = {
                let n = state.in_flight.entry(component.clone()).or_default();
                *n += 1;
                *n
            };
            let max = state.max_in_flight.entry(component.clone()).or_default();
            *max = (*max).max(now);
        }
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        if let Some(n) = self.state.lock().unwrap().in_flight.get_mut(&component) {
            *n -= 1;
        }

        if self.reject.contains(&action.kind()) {
            return Err(EnforcementError::Rejected(format!("{} denied", action.kind())));
        }
        if let Some(telemetry) = &self.heals {
            telemetry.heal(&component);
        }
        Ok(())
    }

    async fn rollback_policy(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<RollbackOutcome, EnforcementError> {
        let (step, action) = self.charter(id)?;
        // Logged under the kind of the compensating action actually issued.
        match self.compensation(id) {
            Some(Compensation::Apply(undo)) => self.log("rollback", step, undo.kind()),
            _ => self.log("rollback", step, action.kind()),
        }
        if self.irreversible.contains(&action.kind()) {
            return Ok(RollbackOutcome::Irreversible {
                reason: format!("{} cannot be undone", action.kind()),
            });
        }
        Ok(RollbackOutcome::Reverted)
    }

    async fn get_policy_status(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<CharterStatus, EnforcementError> {
        let (_, action) = self.charter(id)?;
        if self.never_enforce.contains(&action.kind()) {
            Ok(CharterStatus::Pending)
        } else {
            Ok(CharterStatus::Enforced)
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        jitter_ms: 0,
    }
}

/// One range-queried `cpu_percent` signal, quick retries and short
/// verification windows. The database lives under `dir`.
pub fn test_config(dir: &Path) -> HealConfig {
    let mut config = HealConfig::default();
    config.monitor.signals = vec![SignalConfig {
        range_sec: Some(60),
        ..SignalConfig::above("cpu_percent", 90.0)
    }];
    config.monitor.retry = fast_retry();
    config.monitor.query_timeout_ms = 500;
    config.executor.retry = fast_retry();
    config.executor.action_timeout_ms = 500;
    config.executor.verify_window_ms = 200;
    config.executor.verify_poll_ms = 10;
    config.executor.compensation_timeout_ms = 2_000;
    config.knowledge.db_path = dir.join("autoheal.db");
    config.knowledge.min_sample_size = 1;
    config.api.enabled = false;
    config
}
