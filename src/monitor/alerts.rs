//! Pushed alert ingestion.
//!
//! External alerting can push violation-equivalent events at any time. They
//! queue in a bounded channel and are folded into the next collection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{Violation, ViolationSource};

/// Create a bounded alert channel.
pub fn channel(capacity: usize) -> (AlertSender, AlertInbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        AlertSender { tx },
        AlertInbox {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer side, handed to whatever receives alerts from the outside.
#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<Violation>,
}

impl AlertSender {
    /// Queue an alert, waiting for room.
    pub async fn push(&self, mut alert: Violation) -> Result<(), Violation> {
        alert.source = ViolationSource::Pushed;
        self.tx.send(alert).await.map_err(|e| e.0)
    }

    /// Queue an alert without waiting; a full inbox drops it.
    pub fn try_push(&self, mut alert: Violation) -> bool {
        alert.source = ViolationSource::Pushed;
        match self.tx.try_send(alert) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "alert inbox full, dropping pushed alert");
                false
            }
        }
    }
}

/// Consumer side, owned by the monitor.
#[derive(Clone)]
pub struct AlertInbox {
    rx: Arc<Mutex<mpsc::Receiver<Violation>>>,
}

impl AlertInbox {
    /// Take everything queued so far without waiting for more.
    pub async fn drain(&self) -> Vec<Violation> {
        let mut rx = self.rx.lock().await;
        let mut alerts = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            alerts.push(alert);
        }
        alerts
    }
}

type DedupKey = (String, String, i64);

fn dedup_key(v: &Violation, bucket_sec: u64) -> DedupKey {
    let bucket = v.timestamp.timestamp().div_euclid(bucket_sec.max(1) as i64);
    (v.component.clone(), v.signal.clone(), bucket)
}

/// Fold pushed alerts into the polled violations.
///
/// Polled violations are kept as they are; several samples of one signal are
/// legitimate repeat observations. A pushed alert whose
/// `(component, signal, bucket)` is already covered only survives by
/// replacing a less severe entry. Returns the merged list and how many
/// malformed alerts were discarded.
pub fn merge(
    polled: Vec<Violation>,
    pushed: Vec<Violation>,
    bucket_sec: u64,
) -> (Vec<Violation>, usize) {
    let mut merged = polled;
    let mut index: HashMap<DedupKey, Vec<usize>> = HashMap::new();
    for (i, v) in merged.iter().enumerate() {
        index.entry(dedup_key(v, bucket_sec)).or_default().push(i);
    }

    let mut dropped = 0;
    for alert in pushed {
        if !alert.is_well_formed() {
            warn!(signal = %alert.signal, component = %alert.component, "dropping malformed pushed alert");
            dropped += 1;
            continue;
        }

        let key = dedup_key(&alert, bucket_sec);
        match index.get(&key) {
            None => {
                index.insert(key, vec![merged.len()]);
                merged.push(alert);
            }
            Some(slots) => {
                let weakest = slots
                    .iter()
                    .copied()
                    .min_by_key(|&i| merged[i].severity)
                    .filter(|&i| merged[i].severity < alert.severity);
                match weakest {
                    Some(i) => merged[i] = alert,
                    None => debug!(
                        signal = %alert.signal,
                        component = %alert.component,
                        "duplicate pushed alert"
                    ),
                }
            }
        }
    }

    (merged, dropped)
}
