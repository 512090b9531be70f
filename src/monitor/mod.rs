//! Health signal collection.
//!
//! The monitor queries each configured signal from a [`TelemetrySource`],
//! turns threshold breaches into [`Violation`]s, and merges in alerts pushed
//! through an [`AlertInbox`]. Telemetry outages degrade the report instead of
//! failing the cycle.

pub mod alerts;
pub mod collector;

pub use alerts::{AlertInbox, AlertSender};
pub use collector::Monitor;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::retry::Transient;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("telemetry source unreachable: {0}")]
    Unreachable(String),
    #[error("telemetry query timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed telemetry data: {0}")]
    Malformed(String),
}

impl Transient for TelemetryError {
    fn is_transient(&self) -> bool {
        matches!(self, TelemetryError::Unreachable(_) | TelemetryError::Timeout(_))
    }
}

/// Severity of a threshold breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Critical,
}

/// Which side of the threshold is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    /// How far past the threshold `value` is, as a ratio >= 1, or `None`
    /// when the value is healthy.
    pub fn breach_ratio(self, value: f64, threshold: f64) -> Option<f64> {
        match self {
            Direction::Above if value > threshold => {
                if threshold > 0.0 {
                    Some(value / threshold)
                } else {
                    Some(f64::INFINITY)
                }
            }
            Direction::Below if value < threshold => {
                if value > 0.0 {
                    Some(threshold / value)
                } else {
                    Some(f64::INFINITY)
                }
            }
            _ => None,
        }
    }
}

/// Where a violation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSource {
    Polled,
    Pushed,
}

/// One observed threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub signal: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub source: ViolationSource,
}

impl Violation {
    /// Structural sanity check applied to pushed alerts and decoded samples.
    pub fn is_well_formed(&self) -> bool {
        !self.signal.is_empty()
            && !self.component.is_empty()
            && self.value.is_finite()
            && self.threshold.is_finite()
    }
}

/// One point of a telemetry series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub component: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: Duration,
}

/// An instant (no range) or range query for one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryQuery {
    pub signal: String,
    pub expr: String,
    pub selectors: BTreeMap<String, String>,
    pub range: Option<QueryRange>,
}

/// Read-only access to the telemetry backend.
///
/// Reads must be idempotent; the monitor retries them on transient failure.
#[async_trait::async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn query(
        &self,
        query: &TelemetryQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>, TelemetryError>;
}

/// Result of one collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorReport {
    pub violations: Vec<Violation>,
    /// Some signals could not be read; the violation list is partial.
    pub degraded: bool,
    pub failed_signals: Vec<String>,
    /// Samples or alerts discarded as malformed.
    pub dropped: usize,
}
