// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process store used by tests and embedders

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use af_domain_types::{CanonicalEvent, ProjectState, SessionToken, SideEffectRun};
use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::{EventLog, ProjectStateStore, SideEffectLog, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    events: Vec<CanonicalEvent>,
    states: HashMap<String, ProjectState>,
    runs: Vec<SideEffectRun>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `append` fail with an I/O error
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn update_state<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut ProjectState) -> R,
    ) -> StoreResult<R> {
        let mut inner = self.lock()?;
        let state = inner
            .states
            .entry(task_id.to_string())
            .or_insert_with(|| ProjectState::empty(task_id));
        let result = f(state);
        state.updated_at = Utc::now();
        Ok(result)
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(&self, event: &CanonicalEvent) -> StoreResult<i64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "append rejected",
            )));
        }
        let mut inner = self.lock()?;
        inner.events.push(event.clone());
        Ok(inner.events.len() as i64)
    }

    async fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<CanonicalEvent>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProjectStateStore for MemoryStore {
    async fn load(&self, task_id: &str) -> StoreResult<ProjectState> {
        Ok(self
            .lock()?
            .states
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| ProjectState::empty(task_id)))
    }

    async fn set_session(&self, task_id: &str, token: &SessionToken) -> StoreResult<()> {
        self.update_state(task_id, |s| s.session_token = Some(token.clone()))
    }

    async fn clear_session(&self, task_id: &str) -> StoreResult<()> {
        self.update_state(task_id, |s| s.session_token = None)
    }

    async fn set_running(&self, task_id: &str, pid: u32) -> StoreResult<Option<u32>> {
        let previous = self.update_state(task_id, |s| {
            s.stop_requested = false;
            s.running_pid.replace(pid)
        })?;
        if let Some(stale) = previous.filter(|p| *p != pid) {
            warn!(task_id, stale_pid = stale, pid, "Replacing stale running pid");
        }
        Ok(previous)
    }

    async fn clear_running(&self, task_id: &str) -> StoreResult<()> {
        self.update_state(task_id, |s| {
            s.running_pid = None;
            s.stop_requested = false;
        })
    }

    async fn request_stop(&self, task_id: &str) -> StoreResult<()> {
        self.update_state(task_id, |s| s.stop_requested = true)
    }
}

#[async_trait]
impl SideEffectLog for MemoryStore {
    async fn record(&self, run: &SideEffectRun) -> StoreResult<()> {
        self.lock()?.runs.push(run.clone());
        Ok(())
    }

    async fn list_runs(&self, task_id: &str) -> StoreResult<Vec<SideEffectRun>> {
        Ok(self
            .lock()?
            .runs
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }
}
