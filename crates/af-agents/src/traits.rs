// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core traits and types for agent backends

use af_domain_types::{NormalizedEvent, Provider};
use serde_json::Value;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Backend not enabled in this build: {0}")]
    BackendDisabled(Provider),
}

/// A shell script shipped into the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverScript {
    /// Path relative to the provider's driver directory
    pub path: &'static str,
    pub contents: &'static str,
}

/// Helper sourced by every driver
pub const COMMON_HELPER: DriverScript = DriverScript {
    path: "lib/common.sh",
    contents: include_str!("../drivers/lib/common.sh"),
};

/// Everything the controller needs to run one kind of agent
///
/// Adding a backend means implementing this trait and adding a `Provider`
/// variant. The controller and the turn runner stay untouched.
pub trait AgentBackend: Send + Sync {
    /// Get the name of this backend (e.g., "claude", "codex")
    fn name(&self) -> &'static str;

    fn provider(&self) -> Provider;

    /// Entry point script, uploaded as `driver.sh`
    fn driver(&self) -> DriverScript;

    /// Modules the driver sources
    fn helpers(&self) -> Vec<DriverScript> {
        vec![COMMON_HELPER]
    }

    /// Shell command ensuring the agent CLI is present
    ///
    /// Prints "already installed" when nothing had to be done.
    fn install_command(&self) -> String;

    /// Environment variables carrying this backend's credentials
    fn credential_env(&self) -> &'static [&'static str];

    /// Stop reasons that mark a natural end of turn
    fn default_stop_reasons(&self) -> &'static [&'static str];

    /// Substrings in backend output meaning the resumed session does not exist
    fn default_session_lost_markers(&self) -> &'static [&'static str];

    /// Fresh translator for one process output stream
    fn adapter(&self) -> Box<dyn ProtocolAdapter>;
}

/// Per-backend translation from wire messages to canonical events
///
/// Adapters are the only code allowed to look at backend-specific shapes.
pub trait ProtocolAdapter: Send {
    /// Translate one backend message, in arrival order
    fn translate(&mut self, message: Value) -> Vec<NormalizedEvent>;

    /// Flush anything buffered at end of stream
    fn finish(&mut self) -> Vec<NormalizedEvent> {
        Vec::new()
    }
}

/// npm-based install guard shared by the bundled backends
pub(crate) fn npm_install_command(binary: &str, package: &str) -> String {
    format!(
        "if command -v {binary} >/dev/null 2>&1; then echo 'already installed'; \
         else npm install -g {package} 2>&1; fi"
    )
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
