//! Admission control for policy executions.
//!
//! The [`ExecutionGuard`] combines a sliding-window rate limit with a
//! circuit breaker over enforcement-backend health. All state is held behind
//! a `tokio::sync::RwLock` so every executor task shares one view.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, RateLimitConfig};

/// Why an execution was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateLimited,
    CircuitOpen,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RateLimited => f.write_str("rate limited"),
            DenyReason::CircuitOpen => f.write_str("circuit open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct GuardInner {
    /// Admission instants inside the current window.
    admissions: VecDeque<Instant>,
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    rate: RateLimitConfig,
    breaker: BreakerConfig,
}

impl GuardInner {
    fn window(&self) -> Duration {
        Duration::from_secs(self.rate.window_sec)
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window();
        while let Some(&front) = self.admissions.front() {
            if now.saturating_duration_since(front) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
    }
}

/// Shared admission control for the executor.
pub struct ExecutionGuard {
    inner: RwLock<GuardInner>,
}

impl ExecutionGuard {
    pub fn new(rate: RateLimitConfig, breaker: BreakerConfig) -> Self {
        Self {
            inner: RwLock::new(GuardInner {
                admissions: VecDeque::new(),
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                rate,
                breaker,
            }),
        }
    }

    /// Swap in new limits. Counters and breaker state are kept.
    pub async fn reconfigure(&self, rate: RateLimitConfig, breaker: BreakerConfig) {
        let mut inner = self.inner.write().await;
        inner.rate = rate;
        inner.breaker = breaker;
    }

    /// Admit one execution or say why not. An admitted execution consumes
    /// a slot of the rate window.
    pub async fn admit(&self) -> Result<(), DenyReason> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        if inner.state == BreakerState::Open {
            let open_for = Duration::from_secs(inner.breaker.open_sec);
            let elapsed = inner
                .opened_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            if elapsed < open_for {
                debug!(elapsed_sec = elapsed.as_secs(), "circuit open, execution deferred");
                return Err(DenyReason::CircuitOpen);
            }
            info!("circuit half-open, probing enforcement backend");
            inner.state = BreakerState::HalfOpen;
            inner.half_open_successes = 0;
        }

        inner.prune(now);
        if inner.admissions.len() as u32 >= inner.rate.max_executions {
            debug!(
                count = inner.admissions.len(),
                max = inner.rate.max_executions,
                "execution rate limit reached"
            );
            return Err(DenyReason::RateLimited);
        }

        inner.admissions.push_back(now);
        Ok(())
    }

    /// A backend call succeeded.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= inner.breaker.success_threshold {
                info!("circuit closed");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
            }
        }
    }

    /// A backend call failed for infrastructure reasons (unreachable or
    /// timed out after retries). Logical rejections do not count.
    pub async fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("half-open trial failed, circuit re-opened");
                inner.open(now);
            }
            BreakerState::Closed if inner.consecutive_failures >= inner.breaker.failure_threshold => {
                warn!(
                    failures = inner.consecutive_failures,
                    "enforcement backend failing, circuit opened"
                );
                inner.open(now);
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }
}
