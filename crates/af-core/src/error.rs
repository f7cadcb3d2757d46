// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error type for turn orchestration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The sandbox or a prerequisite was unavailable before any process started
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Store error: {0}")]
    Store(#[from] af_event_store::StoreError),

    #[error("Agent error: {0}")]
    Agent(#[from] af_agents::AgentError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn setup<S: Into<String>>(message: S) -> Self {
        Self::Setup(message.into())
    }

    pub fn sandbox<S: Into<String>>(message: S) -> Self {
        Self::Sandbox(message.into())
    }

    pub fn is_setup(&self) -> bool {
        matches!(self, Error::Setup(_))
    }
}
