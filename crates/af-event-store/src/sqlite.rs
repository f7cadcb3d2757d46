// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLite-backed store

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use af_domain_types::{
    CanonicalEvent, EventKind, ProjectState, RunStatus, SessionToken, SideEffectKind,
    SideEffectRun,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::{schema, EventLog, ProjectStateStore, SideEffectLog, StoreError, StoreResult};

/// Shared SQLite connection with the schema applied
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        debug!("Opening event store at {:?}", path);
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "SQLite journal mode set");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open the database in the platform data directory
    pub fn open_default() -> StoreResult<Self> {
        Self::open(default_path())
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }
}

pub fn default_path() -> PathBuf {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    path.push("app-forge");
    path.push("events.db");
    path
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("bad timestamp {:?}: {}", value, e)))
}

/// Row-level access to the `events` table
pub struct EventTable<'a> {
    conn: &'a Connection,
}

impl<'a> EventTable<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, event: &CanonicalEvent) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO events (task_id, turn_id, session_token, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.task_id,
                event.turn_id,
                event.session_token.as_ref().map(SessionToken::as_str),
                event.kind.as_str(),
                serde_json::to_string(&event.payload)?,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<CanonicalEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, turn_id, session_token, kind, payload, created_at
             FROM events WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (task_id, turn_id, token, kind, payload, created_at) = row?;
            let kind: EventKind = kind.parse().map_err(StoreError::CorruptRow)?;
            events.push(CanonicalEvent {
                session_token: token.map(SessionToken::new),
                task_id,
                turn_id,
                kind,
                payload: serde_json::from_str(&payload)?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(events)
    }
}

/// Row-level access to the `project_state` table
pub struct ProjectStateTable<'a> {
    conn: &'a Connection,
}

impl<'a> ProjectStateTable<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, task_id: &str) -> StoreResult<Option<ProjectState>> {
        let row = self
            .conn
            .query_row(
                "SELECT session_token, running_pid, stop_requested, updated_at
                 FROM project_state WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(token, pid, stop_requested, updated_at)| -> StoreResult<ProjectState> {
            Ok(ProjectState {
                task_id: task_id.to_string(),
                session_token: token.map(SessionToken::new),
                running_pid: pid.and_then(|p| u32::try_from(p).ok()),
                stop_requested,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .transpose()
    }

    pub fn set_session(&self, task_id: &str, token: Option<&str>) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO project_state (task_id, session_token, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET
                session_token = excluded.session_token,
                updated_at = excluded.updated_at",
            params![task_id, token, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record or clear the running pid; either way a pending stop is reset
    pub fn set_running(&self, task_id: &str, pid: Option<u32>) -> StoreResult<Option<u32>> {
        let tx = self.conn.unchecked_transaction()?;
        let previous: Option<i64> = tx
            .query_row(
                "SELECT running_pid FROM project_state WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        tx.execute(
            "INSERT INTO project_state (task_id, running_pid, stop_requested, updated_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(task_id) DO UPDATE SET
                running_pid = excluded.running_pid,
                stop_requested = 0,
                updated_at = excluded.updated_at",
            params![task_id, pid, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(previous.and_then(|p| u32::try_from(p).ok()))
    }

    pub fn request_stop(&self, task_id: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO project_state (task_id, stop_requested, updated_at) VALUES (?1, 1, ?2)
             ON CONFLICT(task_id) DO UPDATE SET
                stop_requested = 1,
                updated_at = excluded.updated_at",
            params![task_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Row-level access to the `side_effect_runs` table
pub struct SideEffectTable<'a> {
    conn: &'a Connection,
}

impl<'a> SideEffectTable<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, run: &SideEffectRun) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO side_effect_runs (task_id, kind, status, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.task_id,
                run.kind.as_str(),
                run.status.as_str(),
                run.detail,
                run.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<SideEffectRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, status, detail, created_at
             FROM side_effect_runs WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (kind, status, detail, created_at) = row?;
            let kind: SideEffectKind = kind.parse().map_err(StoreError::CorruptRow)?;
            let status: RunStatus = status.parse().map_err(StoreError::CorruptRow)?;
            runs.push(SideEffectRun {
                task_id: task_id.to_string(),
                kind,
                status,
                detail,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(runs)
    }
}

/// Async store over a [`Database`]
///
/// Each call takes the connection lock inside `spawn_blocking`, so concurrent
/// turns serialize on the mutex without stalling the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(self.db.connection());
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(&self, event: &CanonicalEvent) -> StoreResult<i64> {
        let event = event.clone();
        self.with_conn(move |conn| EventTable::new(conn).insert(&event)).await
    }

    async fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<CanonicalEvent>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| EventTable::new(conn).list_for_task(&task_id))
            .await
    }
}

#[async_trait]
impl ProjectStateStore for SqliteStore {
    async fn load(&self, task_id: &str) -> StoreResult<ProjectState> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            Ok(ProjectStateTable::new(conn)
                .get(&task_id)?
                .unwrap_or_else(|| ProjectState::empty(task_id.as_str())))
        })
        .await
    }

    async fn set_session(&self, task_id: &str, token: &SessionToken) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let token = token.clone();
        self.with_conn(move |conn| {
            ProjectStateTable::new(conn).set_session(&task_id, Some(token.as_str()))
        })
        .await
    }

    async fn clear_session(&self, task_id: &str) -> StoreResult<()> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| ProjectStateTable::new(conn).set_session(&task_id, None))
            .await
    }

    async fn set_running(&self, task_id: &str, pid: u32) -> StoreResult<Option<u32>> {
        let owned = task_id.to_string();
        let previous = self
            .with_conn(move |conn| ProjectStateTable::new(conn).set_running(&owned, Some(pid)))
            .await?;
        if let Some(stale) = previous.filter(|p| *p != pid) {
            warn!(task_id, stale_pid = stale, pid, "Replacing stale running pid");
        }
        Ok(previous)
    }

    async fn clear_running(&self, task_id: &str) -> StoreResult<()> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            ProjectStateTable::new(conn).set_running(&task_id, None).map(|_| ())
        })
        .await
    }

    async fn request_stop(&self, task_id: &str) -> StoreResult<()> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| ProjectStateTable::new(conn).request_stop(&task_id))
            .await
    }
}

#[async_trait]
impl SideEffectLog for SqliteStore {
    async fn record(&self, run: &SideEffectRun) -> StoreResult<()> {
        let run = run.clone();
        self.with_conn(move |conn| SideEffectTable::new(conn).insert(&run)).await
    }

    async fn list_runs(&self, task_id: &str) -> StoreResult<Vec<SideEffectRun>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| SideEffectTable::new(conn).list_for_task(&task_id))
            .await
    }
}
