// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Side-effect run bookkeeping and per-task project state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::SessionToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    Reload,
    Snapshot,
    BundleExport,
}

impl SideEffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectKind::Reload => "reload",
            SideEffectKind::Snapshot => "snapshot",
            SideEffectKind::BundleExport => "bundle_export",
        }
    }
}

impl std::str::FromStr for SideEffectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reload" => Ok(SideEffectKind::Reload),
            "snapshot" => Ok(SideEffectKind::Snapshot),
            "bundle_export" => Ok(SideEffectKind::BundleExport),
            _ => Err(format!("Unknown side effect kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// One state change of a post-turn action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffectRun {
    pub task_id: String,
    pub kind: SideEffectKind,
    pub status: RunStatus,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SideEffectRun {
    pub fn new(
        task_id: impl Into<String>,
        kind: SideEffectKind,
        status: RunStatus,
        detail: Option<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            status,
            detail,
            created_at: Utc::now(),
        }
    }

    pub fn started(task_id: impl Into<String>, kind: SideEffectKind) -> Self {
        Self::new(task_id, kind, RunStatus::Started, None)
    }

    pub fn completed(
        task_id: impl Into<String>,
        kind: SideEffectKind,
        detail: Option<String>,
    ) -> Self {
        Self::new(task_id, kind, RunStatus::Completed, detail)
    }

    pub fn failed(
        task_id: impl Into<String>,
        kind: SideEffectKind,
        error: impl Into<String>,
    ) -> Self {
        Self::new(task_id, kind, RunStatus::Failed, Some(error.into()))
    }
}

/// The single mutable row kept per task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub task_id: String,
    pub session_token: Option<SessionToken>,
    pub running_pid: Option<u32>,
    /// Set by a stop request, reset when the next process is recorded
    #[serde(default)]
    pub stop_requested: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    pub fn empty(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            session_token: None,
            running_pid: None,
            stop_requested: false,
            updated_at: Utc::now(),
        }
    }
}
