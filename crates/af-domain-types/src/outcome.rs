// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Turn outcome types

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::{EventKind, NormalizedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the completion detector arrived at the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeSource {
    /// The backend emitted a terminal result event
    Explicit,
    /// An assistant message ended with a natural stop reason
    InferredFromStopReason,
    /// The process exited without a terminal event
    FallbackExit,
    /// The process produced no output before the watchdog fired
    FallbackTimeout,
    /// The single retry after a lost session failed as well
    FallbackRetry,
    /// The turn was stopped on request
    Cancelled,
}

impl OutcomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSource::Explicit => "explicit",
            OutcomeSource::InferredFromStopReason => "inferred-from-stop-reason",
            OutcomeSource::FallbackExit => "fallback-exit",
            OutcomeSource::FallbackTimeout => "fallback-timeout",
            OutcomeSource::FallbackRetry => "fallback-retry",
            OutcomeSource::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OutcomeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single terminal verdict of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub status: OutcomeStatus,
    pub source: OutcomeSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TurnOutcome {
    pub fn success(source: OutcomeSource) -> Self {
        Self {
            status: OutcomeStatus::Success,
            source,
            detail: None,
        }
    }

    pub fn error(source: OutcomeSource, detail: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Error,
            source,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Whether post-turn side effects should run for this outcome
    pub fn triggers_side_effects(&self) -> bool {
        self.is_success() && self.source != OutcomeSource::Cancelled
    }

    /// Derive the outcome from a backend-reported result event
    pub fn from_explicit(event: &NormalizedEvent) -> Option<Self> {
        let status = event.result_status()?;
        let detail = match status {
            OutcomeStatus::Success => event
                .payload
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string),
            OutcomeStatus::Error => event.error_text().map(str::to_string),
        };
        Some(Self {
            status,
            source: OutcomeSource::Explicit,
            detail,
        })
    }

    /// Synthesized result event for outcomes not reported by the backend
    pub fn to_event(&self) -> NormalizedEvent {
        let mut payload = json!({
            "status": self.status,
            "source": self.source,
        });
        if let Some(detail) = &self.detail {
            let key = if self.is_success() { "summary" } else { "error" };
            payload[key] = Value::String(detail.clone());
        }
        NormalizedEvent::new(EventKind::Result, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_event_carries_source() {
        let outcome = TurnOutcome::error(OutcomeSource::FallbackTimeout, "no output");
        let event = outcome.to_event();
        assert_eq!(event.kind, EventKind::Result);
        assert_eq!(event.payload["source"], "fallback-timeout");
        assert_eq!(event.payload["status"], "error");
        assert_eq!(event.error_text(), Some("no output"));
    }

    #[test]
    fn test_cancelled_success_skips_side_effects() {
        assert!(TurnOutcome::success(OutcomeSource::Explicit).triggers_side_effects());
        assert!(!TurnOutcome::success(OutcomeSource::Cancelled).triggers_side_effects());
        assert!(!TurnOutcome::error(OutcomeSource::FallbackExit, "exit 1").triggers_side_effects());
    }

    #[test]
    fn test_from_explicit_reads_summary() {
        let event =
            NormalizedEvent::explicit_result(OutcomeStatus::Success, Some("built it".into()), None);
        let outcome = TurnOutcome::from_explicit(&event).unwrap();
        assert_eq!(outcome.source, OutcomeSource::Explicit);
        assert_eq!(outcome.detail.as_deref(), Some("built it"));
    }
}
