// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Durable storage for the App Forge agent pipeline
//!
//! Three concerns share one database:
//! - the append-only canonical event log, read back in insertion order,
//! - one project-state row per task (session token, running pid, stop flag),
//! - the side-effect run log.
//!
//! Writers in the hot path go through [`AppendQueue`], which serializes
//! appends for a turn and never surfaces storage failures to the caller.

pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod writer;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::{Database, SqliteStore};
pub use writer::{AppendQueue, AppendStats};

use af_domain_types::{CanonicalEvent, ProjectState, SessionToken, SideEffectRun};
use async_trait::async_trait;

/// Append-only canonical event log
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Insert one event, returning its insertion id
    async fn append(&self, event: &CanonicalEvent) -> StoreResult<i64>;

    /// All events of a task in insertion order
    async fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<CanonicalEvent>>;
}

/// Narrow operations on the per-task project-state row
///
/// There is at most one running pid per task. `set_running` replaces a stale
/// value and reports it back.
#[async_trait]
pub trait ProjectStateStore: Send + Sync {
    /// Current row, or an empty state when the task has none yet
    async fn load(&self, task_id: &str) -> StoreResult<ProjectState>;

    async fn set_session(&self, task_id: &str, token: &SessionToken) -> StoreResult<()>;

    async fn clear_session(&self, task_id: &str) -> StoreResult<()>;

    /// Record the running pid, returning the pid it replaced
    ///
    /// Resets a pending stop request.
    async fn set_running(&self, task_id: &str, pid: u32) -> StoreResult<Option<u32>>;

    async fn clear_running(&self, task_id: &str) -> StoreResult<()>;

    /// Mark the running process as stopped on purpose
    ///
    /// The flag is visible to the process following the turn, which may live
    /// in another program than the one asking for the stop.
    async fn request_stop(&self, task_id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait SideEffectLog: Send + Sync {
    async fn record(&self, run: &SideEffectRun) -> StoreResult<()>;

    async fn list_runs(&self, task_id: &str) -> StoreResult<Vec<SideEffectRun>>;
}

/// Everything the pipeline needs from storage
pub trait Store: EventLog + ProjectStateStore + SideEffectLog {}

impl<T: EventLog + ProjectStateStore + SideEffectLog> Store for T {}
