//! Bounded exponential backoff for transient I/O failures.
//!
//! Used by the monitor for telemetry reads and by the executor for
//! enforcement calls. Only errors that report themselves as transient are
//! retried; everything else is returned on the first attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;

/// Classifies an error as worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("{0}")]
    Fatal(E),
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if the operation produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Fatal(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Delay before attempt `attempt + 1` (zero-based), without jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or
/// `cancel` fires.
pub async fn with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            r = op() => r,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryError::Fatal(e)),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= attempts {
            return Err(RetryError::Exhausted { attempts, last: err });
        }

        let mut delay = backoff_delay(config, attempt - 1);
        if config.jitter_ms > 0 {
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=config.jitter_ms));
        }
        debug!(
            operation = what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
