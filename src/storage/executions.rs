//! Finished policy executions, kept for the API and post-mortems.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use crate::executor::PolicyExecution;
use crate::storage::Pool;

#[derive(Clone)]
pub struct ExecutionLog {
    pool: Pool,
}

impl ExecutionLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Store (or overwrite) the record of an execution.
    pub fn record(&self, execution: &PolicyExecution) -> Result<()> {
        let conn = self.pool.get()?;
        let record_json =
            serde_json::to_string(execution).context("failed to encode execution record")?;
        let finished_at = execution
            .finished_at
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339();

        conn.execute(
            "INSERT OR REPLACE INTO executions (id, policy_id, component, status, record_json, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                execution.id.to_string(),
                execution.policy_id.to_string(),
                execution.component,
                execution.status.as_str(),
                record_json,
                finished_at,
            ],
        )?;

        Ok(())
    }

    /// Most recently finished executions first. Rows that no longer decode
    /// are skipped.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<PolicyExecution>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, record_json FROM executions ORDER BY finished_at DESC, id LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut executions = Vec::new();
        for row in rows {
            let (id, json) = row?;
            match serde_json::from_str::<PolicyExecution>(&json) {
                Ok(execution) => executions.push(execution),
                Err(e) => warn!(execution = %id, error = %e, "skipping unreadable execution record"),
            }
        }
        Ok(executions)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<PolicyExecution>> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM executions WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| serde_json::from_str(&j).context("corrupt execution record"))
            .transpose()
    }
}
