//! TOML configuration for the autoheal control loop.
//!
//! Every section carries compiled-in defaults so a partial (or empty) file is
//! valid. The file path can be overridden with `AUTOHEAL_CONFIG`. The
//! orchestrator re-reads the file between cycles through [`ConfigWatcher`];
//! a cycle never observes a configuration change half-way through.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analyzer::SignalCategory;
use crate::monitor::Direction;
use crate::orchestrator::CyclePhase;
use crate::planner::ActionKind;

/// Environment variable that points at the configuration file.
pub const CONFIG_ENV: &str = "AUTOHEAL_CONFIG";

/// Standard system location for the configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/autoheal/autoheal.toml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the control loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealConfig {
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HealConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded autoheal configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `AUTOHEAL_CONFIG` environment variable.
    /// 2. `/etc/autoheal/autoheal.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Some(path) = Self::discover_path() {
            match Self::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "config file could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// The file `load_or_default` would read, if any.
    pub fn discover_path() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(env_path));
        }
        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        system_path.exists().then(|| system_path.to_path_buf())
    }

    /// Reject values that would make the loop misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle.interval_sec == 0 {
            return Err(invalid("cycle.interval_sec", "must be greater than zero"));
        }
        for phase in CyclePhase::ACTIVE {
            if self.cycle.phase_timeout(phase).is_zero() {
                return Err(invalid(
                    format!("cycle.{}_timeout_ms", phase.as_str()),
                    "must be greater than zero",
                ));
            }
        }

        for (i, signal) in self.monitor.signals.iter().enumerate() {
            if signal.name.trim().is_empty() {
                return Err(invalid(format!("monitor.signals[{i}].name"), "must not be empty"));
            }
            if !signal.threshold.is_finite() {
                return Err(invalid(
                    format!("monitor.signals[{i}].threshold"),
                    "must be a finite number",
                ));
            }
            if signal.direction == Direction::Below && signal.threshold <= 0.0 {
                return Err(invalid(
                    format!("monitor.signals[{i}].threshold"),
                    "below-threshold signals need a positive threshold",
                ));
            }
            if !(signal.critical_ratio >= 1.0) {
                return Err(invalid(
                    format!("monitor.signals[{i}].critical_ratio"),
                    "must be at least 1.0",
                ));
            }
        }
        if self.monitor.query_concurrency == 0 {
            return Err(invalid("monitor.query_concurrency", "must be greater than zero"));
        }
        if self.monitor.alert_bucket_sec == 0 {
            return Err(invalid("monitor.alert_bucket_sec", "must be greater than zero"));
        }
        self.monitor.retry.validate("monitor.retry")?;

        let a = &self.analyzer;
        if a.window_sec == 0 || a.bucket_sec == 0 || a.causal_window_sec < a.bucket_sec {
            return Err(invalid(
                "analyzer.window_sec",
                "windows must be non-zero and the causal window at least one bucket",
            ));
        }
        if a.burst_count == 0 || a.spatial_min_signals < 2 {
            return Err(invalid(
                "analyzer.burst_count",
                "burst_count must be positive and spatial_min_signals at least 2",
            ));
        }
        unit_interval("analyzer.correlation_threshold", a.correlation_threshold)?;
        unit_interval("analyzer.history_weight", a.history_weight)?;
        unit_interval("analyzer.suppression_decay", a.suppression_decay)?;
        if !(a.k_sigma > 0.0) {
            return Err(invalid("analyzer.k_sigma", "must be positive"));
        }

        let p = &self.planner;
        if p.top_k == 0 {
            return Err(invalid("planner.top_k", "must be at least 1"));
        }
        if p.max_targets == 0 {
            return Err(invalid("planner.max_targets", "must be at least 1"));
        }
        unit_interval("planner.approval_blast_radius", p.approval_blast_radius)?;
        unit_interval("planner.unknown_prior", p.unknown_prior)?;
        unit_interval("planner.cost_weights.blast_radius", p.cost_weights.blast_radius)?;
        unit_interval("planner.cost_weights.downtime", p.cost_weights.downtime)?;
        unit_interval("planner.cost_weights.reversibility", p.cost_weights.reversibility)?;
        unit_interval("planner.benefit_weights.resolution", p.benefit_weights.resolution)?;
        unit_interval("planner.benefit_weights.severity", p.benefit_weights.severity)?;
        for (kind, radius) in &p.blast_radius {
            unit_interval(&format!("planner.blast_radius.{}", kind.as_str()), *radius)?;
        }
        if !(p.min_cost > 0.0) {
            return Err(invalid("planner.min_cost", "must be positive"));
        }

        let e = &self.executor;
        if e.workers == 0 {
            return Err(invalid("executor.workers", "must be greater than zero"));
        }
        if e.verify_poll_ms == 0 || e.verify_window_ms < e.verify_poll_ms {
            return Err(invalid(
                "executor.verify_window_ms",
                "verify window must cover at least one poll interval",
            ));
        }
        if e.rate_limit.max_executions == 0 {
            return Err(invalid("executor.rate_limit.max_executions", "must be at least 1"));
        }
        if e.circuit_breaker.failure_threshold == 0 || e.circuit_breaker.success_threshold == 0 {
            return Err(invalid(
                "executor.circuit_breaker",
                "thresholds must be greater than zero",
            ));
        }
        e.retry.validate("executor.retry")?;

        if self.knowledge.min_sample_size == 0 {
            return Err(invalid("knowledge.min_sample_size", "must be at least 1"));
        }
        let t = &self.knowledge.thresholds;
        if !(0.0..1.0).contains(&t.tighten_step) || !(0.0..1.0).contains(&t.relax_step) {
            return Err(invalid(
                "knowledge.thresholds.tighten_step",
                "steps must lie in [0, 1)",
            ));
        }
        if !(t.min_factor > 0.0 && t.min_factor <= 1.0 && t.max_factor >= 1.0 && t.max_factor.is_finite()) {
            return Err(invalid(
                "knowledge.thresholds.min_factor",
                "need 0 < min_factor <= 1 <= max_factor",
            ));
        }
        if !(t.fast_mttr_sec >= 0.0 && t.fast_mttr_sec <= t.slow_mttr_sec) {
            return Err(invalid(
                "knowledge.thresholds.fast_mttr_sec",
                "must be non-negative and not above slow_mttr_sec",
            ));
        }

        Ok(())
    }
}

fn unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside [0, 1]")))
    }
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Cycle cadence and per-phase time budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Seconds between cycle starts.
    pub interval_sec: u64,
    pub monitor_timeout_ms: u64,
    pub analyze_timeout_ms: u64,
    pub plan_timeout_ms: u64,
    pub execute_timeout_ms: u64,
    pub learn_timeout_ms: u64,
    /// Cycles an approval-required policy waits for an operator before it is dropped.
    pub approval_ttl_cycles: u64,
    /// Upper bound on parked approval-required policies.
    pub max_pending_approvals: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_sec: 30,
            monitor_timeout_ms: 10_000,
            analyze_timeout_ms: 5_000,
            plan_timeout_ms: 5_000,
            execute_timeout_ms: 120_000,
            learn_timeout_ms: 15_000,
            approval_ttl_cycles: 10,
            max_pending_approvals: 32,
        }
    }
}

impl CycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    /// Time budget for `phase`. `Idle` has no budget and reports zero.
    pub fn phase_timeout(&self, phase: CyclePhase) -> Duration {
        let ms = match phase {
            CyclePhase::Idle => 0,
            CyclePhase::Monitoring => self.monitor_timeout_ms,
            CyclePhase::Analyzing => self.analyze_timeout_ms,
            CyclePhase::Planning => self.plan_timeout_ms,
            CyclePhase::Executing => self.execute_timeout_ms,
            CyclePhase::Learning => self.learn_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for transient I/O failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            jitter_ms: 100,
        }
    }
}

impl RetryConfig {
    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid(format!("{field}.max_attempts"), "must be at least 1"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid(
                format!("{field}.max_backoff_ms"),
                "must not be smaller than initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Health signal collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub signals: Vec<SignalConfig>,
    /// Bound on a single telemetry query attempt.
    pub query_timeout_ms: u64,
    /// Number of signal queries in flight at once.
    pub query_concurrency: usize,
    pub retry: RetryConfig,
    /// Width of the timestamp bucket used to de-duplicate pushed alerts.
    pub alert_bucket_sec: u64,
    /// Capacity of the pushed-alert channel.
    pub alert_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            signals: vec![
                SignalConfig::above("cpu_percent", 90.0),
                SignalConfig::above("memory_percent", 85.0),
                SignalConfig::above("packet_loss_percent", 5.0),
            ],
            query_timeout_ms: 2_000,
            query_concurrency: 8,
            retry: RetryConfig::default(),
            alert_bucket_sec: 30,
            alert_buffer: 1_024,
        }
    }
}

impl MonitorConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// One watched signal and its threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub name: String,
    /// Backend query expression. Defaults to the signal name.
    pub query: Option<String>,
    /// Label selectors passed through to the telemetry source.
    pub selectors: BTreeMap<String, String>,
    pub threshold: f64,
    pub direction: Direction,
    /// Breach ratio at or above which a violation is CRITICAL.
    pub critical_ratio: f64,
    /// When set, a range query over the last `range_sec` seconds is issued.
    pub range_sec: Option<u64>,
    /// Resolution step for range queries.
    pub step_sec: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            query: None,
            selectors: BTreeMap::new(),
            threshold: 0.0,
            direction: Direction::Above,
            critical_ratio: 1.2,
            range_sec: None,
            step_sec: 15,
        }
    }
}

impl SignalConfig {
    pub fn above(name: &str, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            threshold,
            ..Self::default()
        }
    }

    pub fn below(name: &str, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            threshold,
            direction: Direction::Below,
            ..Self::default()
        }
    }

    pub fn query_expr(&self) -> &str {
        self.query.as_deref().unwrap_or(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Pattern detector tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Sliding window for temporal and spatial detection.
    pub window_sec: u64,
    /// Same-signal violations within the window that make a burst.
    pub burst_count: usize,
    /// Distinct signals on one component within the window that make a co-location.
    pub spatial_min_signals: usize,
    /// Span of the timelines compared by the causal detector.
    pub causal_window_sec: u64,
    pub bucket_sec: u64,
    pub max_lag_buckets: usize,
    pub correlation_threshold: f64,
    /// Standard deviations from the rolling baseline that make a frequency anomaly.
    pub k_sigma: f64,
    pub baseline_cycles: usize,
    pub min_baseline_cycles: usize,
    /// Cycles of violations retained for detection.
    pub history_cycles: usize,
    /// Weight of historical hypothesis accuracy in the confidence blend.
    pub history_weight: f64,
    /// Cycles during which an ineffective remediation suppresses its hypothesis.
    pub suppression_cycles: u64,
    /// Multiplier applied to a suppressed hypothesis' confidence.
    pub suppression_decay: f64,
    /// Explicit signal categories; unlisted signals are classified by name.
    pub signal_categories: BTreeMap<String, SignalCategory>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_sec: 60,
            burst_count: 3,
            spatial_min_signals: 2,
            causal_window_sec: 300,
            bucket_sec: 10,
            max_lag_buckets: 3,
            correlation_threshold: 0.8,
            k_sigma: 3.0,
            baseline_cycles: 20,
            min_baseline_cycles: 5,
            history_cycles: 64,
            history_weight: 0.3,
            suppression_cycles: 5,
            suppression_decay: 0.5,
            signal_categories: BTreeMap::new(),
        }
    }
}

impl AnalyzerConfig {
    pub fn category_of(&self, signal: &str) -> SignalCategory {
        self.signal_categories
            .get(signal)
            .copied()
            .unwrap_or_else(|| SignalCategory::infer(signal))
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// How much the loop may do without an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autonomy {
    /// Execute the single top candidate; blast radius never requires approval.
    FullAuto,
    /// Policies above `approval_blast_radius` wait for an operator.
    Supervised,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    pub blast_radius: f64,
    pub downtime: f64,
    pub reversibility: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            blast_radius: 0.5,
            downtime: 0.3,
            reversibility: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenefitWeights {
    pub resolution: f64,
    pub severity: f64,
}

impl Default for BenefitWeights {
    fn default() -> Self {
        Self {
            resolution: 0.7,
            severity: 0.3,
        }
    }
}

/// Remediation planning and scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub autonomy: Autonomy,
    /// Candidates kept per hypothesis and target in supervised mode.
    pub top_k: usize,
    /// Components remediated per hypothesis, lead first. A cascading
    /// failure only ever targets its origin.
    pub max_targets: usize,
    pub approval_blast_radius: f64,
    pub cost_weights: CostWeights,
    pub benefit_weights: BenefitWeights,
    /// Downtime that saturates the downtime cost term.
    pub downtime_norm_sec: f64,
    pub min_cost: f64,
    /// Resolution probability assumed while a pair's confidence is unknown.
    pub unknown_prior: f64,
    /// Catalog switches. Unlisted kinds are enabled.
    pub actions: BTreeMap<ActionKind, bool>,
    /// Per-kind blast radius overrides.
    pub blast_radius: BTreeMap<ActionKind, f64>,
    /// Topology facts the catalog needs to parameterise actions.
    pub components: BTreeMap<String, ComponentProfile>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            autonomy: Autonomy::Supervised,
            top_k: 3,
            max_targets: 3,
            approval_blast_radius: 0.6,
            cost_weights: CostWeights::default(),
            benefit_weights: BenefitWeights::default(),
            downtime_norm_sec: 60.0,
            min_cost: 0.05,
            unknown_prior: 0.25,
            actions: BTreeMap::new(),
            blast_radius: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }
}

impl PlannerConfig {
    pub fn action_enabled(&self, kind: ActionKind) -> bool {
        self.actions.get(&kind).copied().unwrap_or(true)
    }

    pub fn profile(&self, component: &str) -> ComponentProfile {
        self.components.get(component).cloned().unwrap_or_default()
    }
}

/// What the planner knows about a component's topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentProfile {
    pub replicas: u32,
    pub scale_step: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Standby target for failover.
    pub standby: Option<String>,
    /// Route currently carrying traffic.
    pub current_route: String,
    /// Route traffic can be moved to.
    pub alternate_route: Option<String>,
    pub current_revision: Option<String>,
    /// Last known good configuration revision.
    pub previous_revision: Option<String>,
}

impl Default for ComponentProfile {
    fn default() -> Self {
        Self {
            replicas: 1,
            scale_step: 1,
            min_replicas: 1,
            max_replicas: 10,
            standby: None,
            current_route: "primary".to_string(),
            alternate_route: None,
            current_revision: None,
            previous_revision: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Policy executions admitted per rolling window.
    pub max_executions: u32,
    pub window_sec: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_executions: 10,
            window_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive backend failures that open the breaker.
    pub failure_threshold: u32,
    /// Half-open successes that close it again.
    pub success_threshold: u32,
    /// Seconds the breaker stays open before probing.
    pub open_sec: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_sec: 60,
        }
    }
}

/// Policy execution against the enforcement backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Concurrent executions across distinct components.
    pub workers: usize,
    /// Bound on a single enforcement call attempt.
    pub action_timeout_ms: u64,
    /// Window in which an applied action must report as enforced.
    pub verify_window_ms: u64,
    pub verify_poll_ms: u64,
    /// Bound on the whole compensation sequence of one execution.
    pub compensation_timeout_ms: u64,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: BreakerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            action_timeout_ms: 10_000,
            verify_window_ms: 15_000,
            verify_poll_ms: 1_000,
            compensation_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: BreakerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn verify_window(&self) -> Duration {
        Duration::from_millis(self.verify_window_ms)
    }

    pub fn verify_poll(&self) -> Duration {
        Duration::from_millis(self.verify_poll_ms)
    }

    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_millis(self.compensation_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Knowledge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// SQLite file holding the outcome log and derived aggregates.
    pub db_path: PathBuf,
    /// Samples below which a pair's confidence is reported as unknown.
    pub min_sample_size: u64,
    /// Capacity of the writer's command queue.
    pub command_buffer: usize,
    pub thresholds: ThresholdTuning,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/autoheal.db"),
            min_sample_size: 5,
            command_buffer: 256,
            thresholds: ThresholdTuning::default(),
        }
    }
}

/// Outcome-driven threshold adjustment.
///
/// Each signal carries a factor applied to its configured threshold:
/// below 1.0 a breach is reported earlier, above 1.0 later. Failed or slow
/// recoveries tighten the factor, fast ones relax it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTuning {
    pub enabled: bool,
    /// Share of the factor removed after a failed or slow recovery.
    pub tighten_step: f64,
    /// Share of the factor added back after a fast recovery.
    pub relax_step: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    /// Recoveries at or under this MTTR relax.
    pub fast_mttr_sec: f64,
    /// Recoveries over this MTTR tighten.
    pub slow_mttr_sec: f64,
}

impl Default for ThresholdTuning {
    fn default() -> Self {
        Self {
            enabled: true,
            tighten_step: 0.05,
            relax_step: 0.02,
            min_factor: 0.5,
            max_factor: 1.0,
            fast_mttr_sec: 60.0,
            slow_mttr_sec: 300.0,
        }
    }
}

// ---------------------------------------------------------------------------
// API / Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Listen address for `/metrics` and the JSON API.
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:9464".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// Holds the active configuration and re-reads the backing file on request.
pub struct ConfigWatcher {
    path: Option<PathBuf>,
    current: Arc<HealConfig>,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Watch the file at `path`. The initial load must succeed.
    pub fn new(path: PathBuf) -> Result<Self> {
        let config = HealConfig::load(&path)?;
        let modified = mtime(&path);
        Ok(Self {
            path: Some(path),
            current: Arc::new(config),
            modified,
        })
    }

    /// A watcher over a configuration that never changes.
    pub fn fixed(config: HealConfig) -> Self {
        Self {
            path: None,
            current: Arc::new(config),
            modified: None,
        }
    }

    pub fn current(&self) -> Arc<HealConfig> {
        Arc::clone(&self.current)
    }

    /// Re-read the file if it changed since the last load.
    ///
    /// Returns the new configuration when it was swapped in. A file that no
    /// longer parses or validates leaves the active configuration untouched.
    pub fn refresh(&mut self) -> Option<Arc<HealConfig>> {
        let path = self.path.as_ref()?;
        let modified = mtime(path);
        if modified.is_none() || modified == self.modified {
            return None;
        }
        self.modified = modified;

        match HealConfig::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration reloaded");
                self.current = Arc::new(config);
                Some(self.current())
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{e:#}"),
                    "configuration reload rejected, keeping previous configuration"
                );
                None
            }
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
