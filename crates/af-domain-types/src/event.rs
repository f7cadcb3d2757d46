// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Canonical event types
//!
//! Every agent backend is translated into the same five event kinds. The
//! payload of each kind follows the shapes documented on [`NormalizedEvent`]'s
//! constructors, so consumers (the event log, the completion detector, the
//! history renderer, the UI) never branch on the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::EnumIter;

use crate::outcome::OutcomeStatus;

/// Backend-assigned handle for a resumable conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Kind of a canonical event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    System,
    User,
    Assistant,
    ToolResult,
    Result,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::System => "system",
            EventKind::User => "user",
            EventKind::Assistant => "assistant",
            EventKind::ToolResult => "tool_result",
            EventKind::Result => "result",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(EventKind::System),
            "user" => Ok(EventKind::User),
            "assistant" => Ok(EventKind::Assistant),
            "tool_result" => Ok(EventKind::ToolResult),
            "result" => Ok(EventKind::Result),
            _ => Err(format!("Unknown event kind: {}", s)),
        }
    }
}

/// Backend-agnostic event produced by a protocol adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub payload: Value,
}

impl NormalizedEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// `{"subtype": "init", "session_id": ...}`
    pub fn system_init(session_id: &str) -> Self {
        Self::new(
            EventKind::System,
            json!({ "subtype": "init", "session_id": session_id }),
        )
    }

    /// `{"subtype": "error", "message": ...}`
    pub fn system_error(message: impl Into<String>) -> Self {
        Self::new(
            EventKind::System,
            json!({ "subtype": "error", "message": message.into() }),
        )
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(
            EventKind::User,
            json!({
                "message": {
                    "role": "user",
                    "content": [{ "type": "text", "text": text.into() }],
                }
            }),
        )
    }

    /// Assistant message made of canonical content blocks
    pub fn assistant(content: Vec<Value>, stop_reason: Option<&str>) -> Self {
        Self::new(
            EventKind::Assistant,
            json!({
                "message": {
                    "role": "assistant",
                    "content": content,
                    "stop_reason": stop_reason,
                }
            }),
        )
    }

    pub fn assistant_text(text: impl Into<String>, stop_reason: Option<&str>) -> Self {
        Self::assistant(vec![text_block(text)], stop_reason)
    }

    /// Assistant message carrying a single `tool_use` block
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::assistant(
            vec![json!({
                "type": "tool_use",
                "id": id.into(),
                "name": name.into(),
                "input": input,
            })],
            None,
        )
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value, is_error: bool) -> Self {
        Self::new(
            EventKind::ToolResult,
            json!({
                "tool_use_id": tool_use_id.into(),
                "content": content,
                "is_error": is_error,
            }),
        )
    }

    /// Terminal event as reported by the backend itself
    pub fn explicit_result(
        status: OutcomeStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Self {
        let mut payload = json!({ "status": status, "source": "explicit" });
        if let Some(summary) = summary {
            payload["summary"] = Value::String(summary);
        }
        if let Some(error) = error {
            payload["error"] = Value::String(error);
        }
        Self::new(EventKind::Result, payload)
    }

    fn subtype(&self) -> Option<&str> {
        self.payload.get("subtype").and_then(Value::as_str)
    }

    pub fn is_init(&self) -> bool {
        self.kind == EventKind::System && self.subtype() == Some("init")
    }

    /// Session token announced by this event, if any
    pub fn session_token(&self) -> Option<SessionToken> {
        if self.kind != EventKind::System {
            return None;
        }
        self.payload
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(SessionToken::new)
    }

    pub fn stop_reason(&self) -> Option<&str> {
        if self.kind != EventKind::Assistant {
            return None;
        }
        self.payload
            .pointer("/message/stop_reason")
            .and_then(Value::as_str)
    }

    pub fn result_status(&self) -> Option<OutcomeStatus> {
        if self.kind != EventKind::Result {
            return None;
        }
        match self.payload.get("status").and_then(Value::as_str) {
            Some("success") => Some(OutcomeStatus::Success),
            Some(_) => Some(OutcomeStatus::Error),
            None => None,
        }
    }

    /// Concatenated text blocks of a user or assistant message
    pub fn text(&self) -> String {
        let Some(content) = self.payload.pointer("/message/content") else {
            return String::new();
        };
        match content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }

    /// Error message carried by a failed result or a system error
    pub fn error_text(&self) -> Option<&str> {
        match self.kind {
            EventKind::Result => self.payload.get("error").and_then(Value::as_str),
            EventKind::System if self.subtype() == Some("error") => {
                self.payload.get("message").and_then(Value::as_str)
            }
            _ => None,
        }
    }
}

pub fn text_block(text: impl Into<String>) -> Value {
    json!({ "type": "text", "text": text.into() })
}

/// Event as persisted in the durable log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub session_token: Option<SessionToken>,
    pub task_id: String,
    pub turn_id: String,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl CanonicalEvent {
    pub fn from_normalized(
        task_id: impl Into<String>,
        turn_id: impl Into<String>,
        session_token: Option<SessionToken>,
        event: NormalizedEvent,
    ) -> Self {
        Self {
            session_token,
            task_id: task_id.into(),
            turn_id: turn_id.into(),
            kind: event.kind,
            payload: event.payload,
            created_at: Utc::now(),
        }
    }

    pub fn as_normalized(&self) -> NormalizedEvent {
        NormalizedEvent::new(self.kind, self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_event_kind_string_round_trip() {
        for kind in EventKind::iter() {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.as_str().to_string())
            );
        }
    }

    #[test]
    fn test_session_token_only_from_system_events() {
        let init = NormalizedEvent::system_init("abc-123");
        assert!(init.is_init());
        assert_eq!(init.session_token(), Some(SessionToken::new("abc-123")));

        let empty = NormalizedEvent::system_init("");
        assert_eq!(empty.session_token(), None);

        let assistant = NormalizedEvent::new(
            EventKind::Assistant,
            json!({ "session_id": "ignored", "message": { "content": [] } }),
        );
        assert_eq!(assistant.session_token(), None);
    }

    #[test]
    fn test_text_joins_text_blocks_only() {
        let event = NormalizedEvent::assistant(
            vec![
                text_block("Hello, "),
                json!({ "type": "tool_use", "id": "t1", "name": "Bash", "input": {} }),
                text_block("world"),
            ],
            Some("end_turn"),
        );
        assert_eq!(event.text(), "Hello, world");
        assert_eq!(event.stop_reason(), Some("end_turn"));
    }

    #[test]
    fn test_result_accessors() {
        let ok =
            NormalizedEvent::explicit_result(OutcomeStatus::Success, Some("done".into()), None);
        assert_eq!(ok.result_status(), Some(OutcomeStatus::Success));
        assert_eq!(ok.error_text(), None);

        let failed =
            NormalizedEvent::explicit_result(OutcomeStatus::Error, None, Some("boom".into()));
        assert_eq!(failed.result_status(), Some(OutcomeStatus::Error));
        assert_eq!(failed.error_text(), Some("boom"));
    }
}
