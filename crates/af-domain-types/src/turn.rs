// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Turn request types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::event::SessionToken;
use crate::provider::Provider;

/// Identifier grouping every event of one user turn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TurnId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One user message dispatched to an agent backend
///
/// Built by the caller and handed over by value; the runner derives its
/// attempt plans from it without mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub task_id: String,
    pub owner_id: String,
    pub provider: Provider,
    pub working_dir: PathBuf,
    pub session_token: Option<SessionToken>,
    /// Large payload, sent only when a fresh session starts
    pub system_instructions: String,
    pub user_message: String,
    pub sandbox_id: String,
}

impl TurnRequest {
    pub fn new(
        task_id: impl Into<String>,
        owner_id: impl Into<String>,
        provider: Provider,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            owner_id: owner_id.into(),
            provider,
            working_dir: PathBuf::from("."),
            session_token: None,
            system_instructions: String::new(),
            user_message: user_message.into(),
            sandbox_id: String::new(),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn session_token(mut self, token: Option<SessionToken>) -> Self {
        self.session_token = token;
        self
    }

    pub fn system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.system_instructions = instructions.into();
        self
    }

    pub fn sandbox_id(mut self, id: impl Into<String>) -> Self {
        self.sandbox_id = id.into();
        self
    }
}
