// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLite schema

use rusqlite::Connection;

use crate::StoreResult;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id       TEXT NOT NULL,
    turn_id       TEXT NOT NULL,
    session_token TEXT,
    kind          TEXT NOT NULL,
    payload       TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, id);

CREATE TABLE IF NOT EXISTS project_state (
    task_id       TEXT PRIMARY KEY,
    session_token TEXT,
    running_pid   INTEGER,
    stop_requested INTEGER NOT NULL DEFAULT 0,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS side_effect_runs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    kind       TEXT NOT NULL,
    status     TEXT NOT NULL,
    detail     TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_side_effect_runs_task ON side_effect_runs(task_id, id);
"#;

pub fn initialize(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(SCHEMA)?;
    add_column_if_missing(
        conn,
        "project_state",
        "stop_requested",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    Ok(())
}

/// Bring databases created before `column` existed up to date
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> StoreResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let present = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .any(|name| name == column);
    if !present {
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {};",
            table, column, definition
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_upgrades_old_project_state() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE project_state (
                task_id TEXT PRIMARY KEY,
                session_token TEXT,
                running_pid INTEGER,
                updated_at TEXT NOT NULL
            );
            INSERT INTO project_state VALUES ('t1', 's-1', 42, '2025-01-01T00:00:00Z');",
        )
        .unwrap();

        initialize(&conn).unwrap();
        // Idempotent on an up-to-date database.
        initialize(&conn).unwrap();

        let flag: i64 = conn
            .query_row(
                "SELECT stop_requested FROM project_state WHERE task_id = 't1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(flag, 0);
    }
}
