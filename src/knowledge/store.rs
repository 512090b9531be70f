//! SQLite side of the knowledge base. All calls block; run them under
//! `spawn_blocking`.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::warn;
use uuid::Uuid;

use super::{Outcome, PairStats, PolicyOutcome};
use crate::analyzer::RootCause;
use crate::planner::ActionKind;
use crate::storage::Pool;

pub type PairKey = (RootCause, ActionKind);

/// Everything derived from a full scan of the outcome log.
#[derive(Debug, Default)]
pub struct LogScan {
    pub pairs: BTreeMap<PairKey, PairStats>,
    pub recorded: HashSet<Uuid>,
    /// Pairs with at least one row that could not be read back.
    pub unreadable: HashSet<PairKey>,
}

#[derive(Clone)]
pub struct OutcomeStore {
    pool: Pool,
}

impl OutcomeStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Append `outcome` and bump its aggregate in one transaction.
    ///
    /// Returns `false` when the execution id was already recorded.
    pub fn append(&self, outcome: &PolicyOutcome) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO policy_outcomes
                (execution_id, policy_id, component, root_cause, action, outcome, metric_delta, mttr_sec, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                outcome.execution_id.to_string(),
                outcome.policy_id.to_string(),
                outcome.component,
                outcome.root_cause.as_str(),
                outcome.action.as_str(),
                outcome.outcome.as_str(),
                outcome.metric_delta,
                outcome.mttr_sec,
                outcome.recorded_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            tx.commit()?;
            return Ok(false);
        }

        let (s, f, r, n) = match outcome.outcome {
            Outcome::Success | Outcome::Partial => (1, 0, 0, 0),
            Outcome::Failure => (0, 1, 0, 0),
            Outcome::RolledBack => (0, 0, 1, 0),
            Outcome::NoOp => (0, 0, 0, 1),
            Outcome::Unverified => (0, 0, 0, 0),
        };
        tx.execute(
            "INSERT INTO learning_aggregates
                (root_cause, action, success_count, failure_count, rollback_count, noop_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(root_cause, action) DO UPDATE SET
                success_count = success_count + excluded.success_count,
                failure_count = failure_count + excluded.failure_count,
                rollback_count = rollback_count + excluded.rollback_count,
                noop_count = noop_count + excluded.noop_count,
                updated_at = excluded.updated_at",
            params![outcome.root_cause.as_str(), outcome.action.as_str(), s, f, r, n],
        )?;

        tx.commit().context("failed to commit outcome")?;
        Ok(true)
    }

    /// Recompute every aggregate from the outcome log.
    pub fn scan_log(&self) -> Result<LogScan> {
        let conn = self.pool.get()?;
        scan(&conn, None)
    }

    /// Aggregates as persisted. Rows naming an unknown root cause or action
    /// are skipped; rows with unreadable counts come back as `None`.
    pub fn load_aggregates(&self) -> Result<BTreeMap<PairKey, Option<PairStats>>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT root_cause, action, success_count, failure_count, rollback_count, noop_count
             FROM learning_aggregates",
        )?;

        let rows = stmt.query_map([], |row| {
            let counts = (|| -> rusqlite::Result<[i64; 4]> {
                Ok([row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?])
            })();
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, counts.ok()))
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (rc, action, counts) = row?;
            let Some(key) = parse_key(&rc, &action) else {
                warn!(root_cause = %rc, action = %action, "ignoring aggregate row for unknown pair");
                continue;
            };
            let stats = counts.filter(|c| c.iter().all(|&v| v >= 0)).map(|[s, f, r, n]| PairStats {
                success_count: s as u64,
                failure_count: f as u64,
                rollback_count: r as u64,
                noop_count: n as u64,
                corrupted: false,
            });
            out.insert(key, stats);
        }
        Ok(out)
    }

    /// Rebuild one pair's aggregate from its readable log rows and persist it.
    pub fn rebuild_pair(&self, key: PairKey) -> Result<PairStats> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let scan = scan(&tx, Some(key))?;
        let stats = scan.pairs.get(&key).copied().unwrap_or_default();

        tx.execute(
            "INSERT OR REPLACE INTO learning_aggregates
                (root_cause, action, success_count, failure_count, rollback_count, noop_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            params![
                key.0.as_str(),
                key.1.as_str(),
                stats.success_count as i64,
                stats.failure_count as i64,
                stats.rollback_count as i64,
                stats.noop_count as i64,
            ],
        )?;
        tx.commit().context("failed to commit rebuilt aggregate")?;
        Ok(stats)
    }

    /// Threshold factors by signal. Non-finite or non-positive rows are
    /// skipped.
    pub fn load_thresholds(&self) -> Result<BTreeMap<String, f64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT signal, factor FROM threshold_adjustments")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (signal, factor) = row?;
            if factor.is_finite() && factor > 0.0 {
                out.insert(signal, factor);
            } else {
                warn!(signal = %signal, factor, "ignoring unusable threshold factor");
            }
        }
        Ok(out)
    }

    pub fn save_thresholds(&self, factors: &[(String, f64)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for (signal, factor) in factors {
            tx.execute(
                "INSERT INTO threshold_adjustments (signal, factor, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(signal) DO UPDATE SET
                    factor = excluded.factor,
                    updated_at = excluded.updated_at",
                params![signal, factor],
            )?;
        }
        tx.commit().context("failed to commit threshold factors")?;
        Ok(())
    }

    pub fn load_replicas(&self) -> Result<BTreeMap<String, u32>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT component, replicas FROM component_state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (component, replicas) = row?;
            match u32::try_from(replicas) {
                Ok(n) => {
                    out.insert(component, n);
                }
                Err(_) => warn!(component = %component, replicas, "ignoring unusable replica count"),
            }
        }
        Ok(out)
    }

    pub fn save_replicas(&self, component: &str, replicas: u32) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO component_state (component, replicas, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(component) DO UPDATE SET
                replicas = excluded.replicas,
                updated_at = excluded.updated_at",
            params![component, replicas as i64],
        )?;
        Ok(())
    }
}

fn parse_key(root_cause: &str, action: &str) -> Option<PairKey> {
    Some((root_cause.parse().ok()?, action.parse().ok()?))
}

fn scan(conn: &Connection, only: Option<PairKey>) -> Result<LogScan> {
    let mut stmt =
        conn.prepare("SELECT execution_id, root_cause, action, outcome FROM policy_outcomes")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut out = LogScan::default();
    for row in rows {
        let (execution_id, rc, action, outcome) = row?;
        if let Ok(id) = Uuid::parse_str(&execution_id) {
            out.recorded.insert(id);
        }

        let Some(key) = parse_key(&rc, &action) else {
            warn!(execution = %execution_id, root_cause = %rc, action = %action, "outcome row names an unknown pair");
            continue;
        };
        if only.is_some_and(|k| k != key) {
            continue;
        }

        match outcome.parse::<Outcome>() {
            Ok(o) => out.pairs.entry(key).or_default().apply(o),
            Err(e) => {
                warn!(execution = %execution_id, error = %e, "unreadable outcome row");
                out.unreadable.insert(key);
            }
        }
    }
    Ok(out)
}
