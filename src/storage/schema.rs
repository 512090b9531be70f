//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS policy_outcomes (
            id INTEGER PRIMARY KEY,
            execution_id TEXT NOT NULL UNIQUE,
            policy_id TEXT NOT NULL,
            component TEXT NOT NULL,
            root_cause TEXT NOT NULL,
            action TEXT NOT NULL,
            outcome TEXT NOT NULL,
            metric_delta REAL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS learning_aggregates (
            root_cause TEXT NOT NULL,
            action TEXT NOT NULL,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            rollback_count INTEGER NOT NULL DEFAULT 0,
            noop_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (root_cause, action)
        );

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            policy_id TEXT NOT NULL,
            component TEXT NOT NULL,
            status TEXT NOT NULL,
            record_json TEXT NOT NULL,
            finished_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS threshold_adjustments (
            signal TEXT PRIMARY KEY,
            factor REAL NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS component_state (
            component TEXT PRIMARY KEY,
            replicas INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_outcomes_pair ON policy_outcomes(root_cause, action);
        CREATE INDEX IF NOT EXISTS idx_executions_finished ON executions(finished_at);",
    )?;

    // Migration: MTTR was added to outcomes after the first release.
    let has_mttr: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('policy_outcomes') WHERE name='mttr_sec'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_mttr == 0 {
        conn.execute("ALTER TABLE policy_outcomes ADD COLUMN mttr_sec REAL", [])?;
    }

    Ok(())
}
