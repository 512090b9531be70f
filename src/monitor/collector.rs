use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::alerts::{self, AlertInbox};
use super::{
    Direction, MonitorReport, QueryRange, Sample, Severity, TelemetryError, TelemetryQuery,
    TelemetrySource, Violation, ViolationSource,
};
use crate::config::{MonitorConfig, SignalConfig};
use crate::retry::{self, RetryError};

/// Turns configured signals into violations.
pub struct Monitor {
    config: MonitorConfig,
    source: Arc<dyn TelemetrySource>,
    inbox: Option<AlertInbox>,
    /// Learned per-signal threshold factors.
    factors: BTreeMap<String, f64>,
    /// Signals only seen in pushed alerts, with the threshold the alert
    /// carried.
    alert_signals: Mutex<HashMap<String, SignalConfig>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, source: Arc<dyn TelemetrySource>) -> Self {
        Self {
            config,
            source,
            inbox: None,
            factors: BTreeMap::new(),
            alert_signals: Mutex::new(HashMap::new()),
        }
    }

    /// Merge alerts pushed through `inbox` into every collection.
    pub fn with_alerts(mut self, inbox: AlertInbox) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Swap in a reloaded configuration. Called between cycles only.
    pub fn reconfigure(&mut self, config: MonitorConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Replace the threshold factors applied from the next collection on.
    /// Signals without a factor use their configured threshold.
    pub fn tune(&mut self, factors: BTreeMap<String, f64>) {
        self.factors = factors;
    }

    /// `signal` with its learned factor applied. A factor below 1.0 moves
    /// the threshold toward healthy values so breaches surface earlier.
    fn effective(&self, signal: &SignalConfig) -> SignalConfig {
        let mut tuned = signal.clone();
        if let Some(&factor) = self.factors.get(&signal.name) {
            tuned.threshold = match signal.direction {
                Direction::Above => signal.threshold * factor,
                Direction::Below => signal.threshold / factor,
            };
        }
        tuned
    }

    /// Threshold source for re-reading `name`: configuration first, then
    /// what a pushed alert told us.
    fn known_signal(&self, name: &str) -> Option<(SignalConfig, bool)> {
        if let Some(signal) = self.config.signals.iter().find(|s| s.name == name) {
            return Some((self.effective(signal), false));
        }
        let learned = self
            .alert_signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()?;
        Some((self.effective(&learned), true))
    }

    fn remember_alert_signals(&self, pushed: &[Violation]) {
        let mut known = self.alert_signals.lock().unwrap_or_else(|e| e.into_inner());
        for alert in pushed.iter().filter(|a| a.is_well_formed()) {
            if self.config.signals.iter().any(|s| s.name == alert.signal) {
                continue;
            }
            let signal = if alert.value < alert.threshold {
                SignalConfig::below(&alert.signal, alert.threshold)
            } else {
                SignalConfig::above(&alert.signal, alert.threshold)
            };
            known.insert(alert.signal.clone(), signal);
        }
    }

    /// Query every configured signal and return the breaches found.
    ///
    /// Never fails: signals that cannot be read are listed in
    /// `failed_signals` and mark the report degraded.
    pub async fn collect(&self, cancel: &CancellationToken) -> MonitorReport {
        let now = Utc::now();
        let concurrency = self.config.query_concurrency.max(1);

        let signals: Vec<SignalConfig> =
            self.config.signals.iter().map(|s| self.effective(s)).collect();
        let outcomes: Vec<(&SignalConfig, Result<Vec<Sample>, RetryError<TelemetryError>>)> =
            stream::iter(signals.iter())
                .map(|signal| async move {
                    let query = build_query(signal, now, None);
                    (signal, self.fetch(&query, cancel).await)
                })
                .buffer_unordered(concurrency)
                .boxed()
                .collect()
                .await;

        let mut report = MonitorReport::default();
        let mut polled = Vec::new();

        for (signal, outcome) in outcomes {
            match outcome {
                Ok(samples) => {
                    for sample in &samples {
                        match evaluate(signal, sample) {
                            Ok(Some(v)) => polled.push(v),
                            Ok(None) => {}
                            Err(e) => {
                                warn!(signal = %signal.name, error = %e, "dropping sample");
                                report.dropped += 1;
                                report.degraded = true;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(signal = %signal.name, error = %e, "signal unavailable this cycle");
                    report.degraded = true;
                    report.failed_signals.push(signal.name.clone());
                }
            }
        }

        if let Some(inbox) = &self.inbox {
            let pushed = inbox.drain().await;
            if !pushed.is_empty() {
                debug!(count = pushed.len(), "merging pushed alerts");
                self.remember_alert_signals(&pushed);
            }
            let (merged, dropped) = alerts::merge(polled, pushed, self.config.alert_bucket_sec);
            polled = merged;
            report.dropped += dropped;
        }

        polled.sort_by_key(|v| v.timestamp);
        report.failed_signals.sort();
        report.violations = polled;

        if !report.violations.is_empty() || report.degraded {
            info!(
                violations = report.violations.len(),
                degraded = report.degraded,
                failed = report.failed_signals.len(),
                "collection finished"
            );
        }
        report
    }

    /// Re-read `signals` for one component and count how many still breach.
    ///
    /// Only the latest sample of each signal counts. `None` when there is
    /// nothing to check, when a signal has no known threshold, when a
    /// signal could not be read, or when a signal learned from a pushed
    /// alert has no sample for `component`.
    pub async fn resample(
        &self,
        component: &str,
        signals: &[String],
        cancel: &CancellationToken,
    ) -> Option<usize> {
        if signals.is_empty() {
            return None;
        }
        let now = Utc::now();
        let mut breaching = 0;

        for name in signals {
            let Some((signal, from_alert)) = self.known_signal(name) else {
                debug!(component, signal = %name, "no threshold known for signal");
                return None;
            };
            let signal = &signal;
            let query = build_query(signal, now, Some(component));
            let samples = match self.fetch(&query, cancel).await {
                Ok(samples) => samples,
                Err(e) => {
                    debug!(component, signal = %signal.name, error = %e, "resample failed");
                    return None;
                }
            };

            let latest = samples
                .iter()
                .filter(|s| s.component == component && s.value.is_finite())
                .max_by_key(|s| s.timestamp);
            match latest {
                Some(sample) => {
                    if signal.direction.breach_ratio(sample.value, signal.threshold).is_some() {
                        breaching += 1;
                    }
                }
                None if from_alert => {
                    debug!(component, signal = %name, "no telemetry for alert-only signal");
                    return None;
                }
                None => {}
            }
        }

        Some(breaching)
    }

    async fn fetch(
        &self,
        query: &TelemetryQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>, RetryError<TelemetryError>> {
        let timeout = self.config.query_timeout();
        let source = &self.source;
        retry::with_backoff(&self.config.retry, cancel, "telemetry query", || async move {
            match tokio::time::timeout(timeout, source.query(query, cancel)).await {
                Ok(result) => result,
                Err(_) => Err(TelemetryError::Timeout(timeout)),
            }
        })
        .await
    }
}

fn build_query(signal: &SignalConfig, now: DateTime<Utc>, component: Option<&str>) -> TelemetryQuery {
    let range = signal.range_sec.filter(|_| component.is_none()).map(|secs| QueryRange {
        start: now - chrono::Duration::seconds(secs as i64),
        end: now,
        step: std::time::Duration::from_secs(signal.step_sec.max(1)),
    });

    let mut selectors = signal.selectors.clone();
    if let Some(component) = component {
        selectors.insert("component".to_string(), component.to_string());
    }

    TelemetryQuery {
        signal: signal.name.clone(),
        expr: signal.query_expr().to_string(),
        selectors,
        range,
    }
}

/// Compare one sample against its signal's threshold.
pub fn evaluate(signal: &SignalConfig, sample: &Sample) -> Result<Option<Violation>, TelemetryError> {
    if !sample.value.is_finite() {
        return Err(TelemetryError::Malformed(format!(
            "non-finite value {} for {}",
            sample.value, sample.component
        )));
    }
    if sample.component.is_empty() {
        return Err(TelemetryError::Malformed("sample without component".into()));
    }

    let Some(ratio) = signal.direction.breach_ratio(sample.value, signal.threshold) else {
        return Ok(None);
    };
    let severity = if ratio >= signal.critical_ratio {
        Severity::Critical
    } else {
        Severity::Warning
    };

    Ok(Some(Violation {
        signal: signal.name.clone(),
        value: sample.value,
        threshold: signal.threshold,
        severity,
        component: sample.component.clone(),
        timestamp: sample.timestamp,
        source: ViolationSource::Polled,
    }))
}

/// Count breaching signals per component in a violation list.
pub fn breaching_signals(violations: &[Violation]) -> HashMap<String, Vec<String>> {
    let mut by_component: HashMap<String, Vec<String>> = HashMap::new();
    for v in violations {
        let signals = by_component.entry(v.component.clone()).or_default();
        if !signals.contains(&v.signal) {
            signals.push(v.signal.clone());
        }
    }
    by_component
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::monitor::{alerts, Direction};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        series: HashMap<String, Result<Vec<Sample>, TelemetryError>>,
        calls: AtomicU32,
        seen: Mutex<Vec<TelemetryQuery>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                series: HashMap::new(),
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn with(mut self, signal: &str, result: Result<Vec<Sample>, TelemetryError>) -> Self {
            self.series.insert(signal.to_string(), result);
            self
        }
    }

    #[async_trait::async_trait]
    impl TelemetrySource for FakeSource {
        async fn query(
            &self,
            query: &TelemetryQuery,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Sample>, TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(query.clone());
            self.series
                .get(&query.signal)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn sample(component: &str, value: f64) -> Sample {
        Sample {
            component: component.to_string(),
            value,
            timestamp: Utc::now(),
        }
    }

    fn config(signals: Vec<SignalConfig>) -> MonitorConfig {
        MonitorConfig {
            signals,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                jitter_ms: 0,
            },
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_collect_classifies_severity() {
        let source = Arc::new(FakeSource::new().with(
            "cpu",
            Ok(vec![
                sample("web-1", 50.0),
                sample("web-2", 95.0),
                sample("web-3", 120.0),
            ]),
        ));
        let monitor = Monitor::new(config(vec![SignalConfig::above("cpu", 90.0)]), source);

        let report = monitor.collect(&CancellationToken::new()).await;
        assert!(!report.degraded);
        assert_eq!(report.violations.len(), 2);

        let web2 = report.violations.iter().find(|v| v.component == "web-2").unwrap();
        assert_eq!(web2.severity, Severity::Warning);
        let web3 = report.violations.iter().find(|v| v.component == "web-3").unwrap();
        assert_eq!(web3.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_below_threshold_signal() {
        let source = Arc::new(
            FakeSource::new().with("free_disk_gb", Ok(vec![sample("db-1", 4.0), sample("db-2", 40.0)])),
        );
        let monitor = Monitor::new(config(vec![SignalConfig::below("free_disk_gb", 10.0)]), source);

        let report = monitor.collect(&CancellationToken::new()).await;
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].component, "db-1");
        assert_eq!(report.violations[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_unreachable_source_degrades_after_retries() {
        let source = Arc::new(
            FakeSource::new()
                .with("cpu", Err(TelemetryError::Unreachable("connection refused".into())))
                .with("mem", Ok(vec![sample("web-1", 99.0)])),
        );
        let monitor = Monitor::new(
            config(vec![SignalConfig::above("cpu", 90.0), SignalConfig::above("mem", 85.0)]),
            source.clone(),
        );

        let report = monitor.collect(&CancellationToken::new()).await;
        assert!(report.degraded);
        assert_eq!(report.failed_signals, vec!["cpu".to_string()]);
        assert_eq!(report.violations.len(), 1);
        // Three attempts for cpu, one for mem.
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_malformed_sample_is_dropped() {
        let source = Arc::new(
            FakeSource::new().with("cpu", Ok(vec![sample("web-1", f64::NAN), sample("web-2", 99.0)])),
        );
        let monitor = Monitor::new(config(vec![SignalConfig::above("cpu", 90.0)]), source);

        let report = monitor.collect(&CancellationToken::new()).await;
        assert!(report.degraded);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.violations.len(), 1);
    }

    #[tokio::test]
    async fn test_range_signal_issues_range_query() {
        let source = Arc::new(FakeSource::new());
        let mut signal = SignalConfig::above("cpu", 90.0);
        signal.range_sec = Some(60);
        let monitor = Monitor::new(config(vec![signal]), source.clone());

        monitor.collect(&CancellationToken::new()).await;
        let seen = source.seen.lock().unwrap();
        let range = seen[0].range.as_ref().unwrap();
        assert_eq!((range.end - range.start).num_seconds(), 60);
        assert_eq!(range.step, std::time::Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_pushed_alerts_are_merged() {
        let (tx, inbox) = alerts::channel(8);
        let monitor = Monitor::new(config(Vec::new()), Arc::new(FakeSource::new())).with_alerts(inbox);

        tx.try_push(Violation {
            signal: "error_rate".into(),
            value: 0.3,
            threshold: 0.1,
            severity: Severity::Critical,
            component: "api-1".into(),
            timestamp: Utc::now(),
            source: ViolationSource::Polled,
        });

        let report = monitor.collect(&CancellationToken::new()).await;
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].source, ViolationSource::Pushed);
    }

    #[tokio::test]
    async fn test_resample_counts_breaching_signals() {
        let source = Arc::new(
            FakeSource::new()
                .with("cpu", Ok(vec![sample("web-1", 95.0), sample("web-2", 99.0)]))
                .with("mem", Ok(vec![sample("web-1", 10.0)])),
        );
        let monitor = Monitor::new(
            config(vec![SignalConfig::above("cpu", 90.0), SignalConfig::above("mem", 85.0)]),
            source.clone(),
        );

        let still = monitor
            .resample("web-1", &["cpu".into(), "mem".into()], &CancellationToken::new())
            .await;
        assert_eq!(still, Some(1));

        let seen = source.seen.lock().unwrap();
        assert!(seen
            .iter()
            .all(|q| q.selectors.get("component").map(String::as_str) == Some("web-1")));
    }

    #[tokio::test]
    async fn test_resample_uses_pushed_alert_threshold() {
        let (tx, inbox) = alerts::channel(8);
        let source = Arc::new(
            FakeSource::new()
                .with("error_rate", Ok(vec![sample("api-1", 0.05)]))
                .with("queue_depth", Ok(vec![sample("api-1", 10.0)])),
        );
        let monitor = Monitor::new(config(Vec::new()), source.clone()).with_alerts(inbox);
        let cancel = CancellationToken::new();

        // Nothing seen yet: no threshold to judge against.
        assert_eq!(monitor.resample("api-1", &["error_rate".into()], &cancel).await, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.resample("api-1", &[], &cancel).await, None);

        tx.try_push(Violation {
            signal: "error_rate".into(),
            value: 0.3,
            threshold: 0.1,
            severity: Severity::Critical,
            component: "api-1".into(),
            timestamp: Utc::now(),
            source: ViolationSource::Pushed,
        });
        monitor.collect(&cancel).await;

        assert_eq!(monitor.resample("api-1", &["error_rate".into()], &cancel).await, Some(0));
        assert_eq!(source.seen.lock().unwrap().last().unwrap().signal, "error_rate");

        // Still breaching once the value climbs back over the alert's threshold.
        let hot = Arc::new(FakeSource::new().with("error_rate", Ok(vec![sample("api-1", 0.2)])));
        let (tx, inbox) = alerts::channel(8);
        let monitor = Monitor::new(config(Vec::new()), hot).with_alerts(inbox);
        tx.try_push(Violation {
            signal: "error_rate".into(),
            value: 0.3,
            threshold: 0.1,
            severity: Severity::Critical,
            component: "api-1".into(),
            timestamp: Utc::now(),
            source: ViolationSource::Pushed,
        });
        monitor.collect(&cancel).await;
        assert_eq!(monitor.resample("api-1", &["error_rate".into()], &cancel).await, Some(1));
        // No series for this component at all.
        assert_eq!(monitor.resample("api-2", &["error_rate".into()], &cancel).await, None);
        // One unknown signal spoils the whole check.
        assert_eq!(
            monitor
                .resample("api-1", &["error_rate".into(), "latency_ms".into()], &cancel)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_tuned_factor_moves_threshold() {
        let source = Arc::new(
            FakeSource::new()
                .with("cpu", Ok(vec![sample("web-1", 85.0)]))
                .with("free_disk_gb", Ok(vec![sample("db-1", 11.0)])),
        );
        let mut monitor = Monitor::new(
            config(vec![SignalConfig::above("cpu", 90.0), SignalConfig::below("free_disk_gb", 10.0)]),
            source,
        );
        let cancel = CancellationToken::new();
        assert!(monitor.collect(&cancel).await.violations.is_empty());

        monitor.tune(BTreeMap::from([
            ("cpu".to_string(), 0.9),
            ("free_disk_gb".to_string(), 0.8),
        ]));
        let report = monitor.collect(&cancel).await;
        assert_eq!(report.violations.len(), 2);
        let cpu = report.violations.iter().find(|v| v.signal == "cpu").unwrap();
        assert!((cpu.threshold - 81.0).abs() < 1e-9);
        let disk = report.violations.iter().find(|v| v.signal == "free_disk_gb").unwrap();
        assert!((disk.threshold - 12.5).abs() < 1e-9);

        assert_eq!(monitor.resample("web-1", &["cpu".into()], &cancel).await, Some(1));
    }

    #[test]
    fn test_evaluate_boundary_is_healthy() {
        let signal = SignalConfig::above("cpu", 90.0);
        assert!(evaluate(&signal, &sample("web-1", 90.0)).unwrap().is_none());
        assert_eq!(signal.direction, Direction::Above);
        assert!(evaluate(&signal, &sample("", 99.0)).is_err());
    }
}
