// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Claude Code backend
//!
//! The driver runs `claude -p --output-format stream-json --verbose`. The same
//! message shapes are yielded by the Agent SDK, so SDK sources reuse
//! [`ClaudeAdapter`] through `StreamNormalizer::push_message`.

use af_domain_types::{EventKind, NormalizedEvent, OutcomeStatus, Provider};
use serde_json::Value;
use tracing::debug;

use crate::traits::{npm_install_command, str_field, AgentBackend, DriverScript, ProtocolAdapter};

pub const STOP_REASONS: &[&str] = &["end_turn", "stop_sequence", "max_tokens"];
pub const SESSION_LOST_MARKERS: &[&str] = &["No conversation found"];

#[derive(Debug, Default, Clone)]
pub struct ClaudeBackend;

impl ClaudeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn driver(&self) -> DriverScript {
        DriverScript {
            path: "driver.sh",
            contents: include_str!("../drivers/claude.sh"),
        }
    }

    fn install_command(&self) -> String {
        npm_install_command("claude", "@anthropic-ai/claude-code")
    }

    fn credential_env(&self) -> &'static [&'static str] {
        &["ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL"]
    }

    fn default_stop_reasons(&self) -> &'static [&'static str] {
        STOP_REASONS
    }

    fn default_session_lost_markers(&self) -> &'static [&'static str] {
        SESSION_LOST_MARKERS
    }

    fn adapter(&self) -> Box<dyn ProtocolAdapter> {
        Box::new(ClaudeAdapter)
    }
}

/// Translator for stream-json / SDK messages
#[derive(Debug, Default)]
pub struct ClaudeAdapter;

impl ProtocolAdapter for ClaudeAdapter {
    fn translate(&mut self, mut message: Value) -> Vec<NormalizedEvent> {
        let message_type = str_field(&message, "type").map(str::to_string);
        match message_type.as_deref() {
            Some("system") => {
                if let Some(obj) = message.as_object_mut() {
                    obj.remove("type");
                }
                vec![NormalizedEvent::new(EventKind::System, message)]
            }
            Some("assistant") => {
                let content = message
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let stop_reason = message
                    .pointer("/message/stop_reason")
                    .and_then(Value::as_str);
                vec![NormalizedEvent::assistant(content, stop_reason)]
            }
            Some("user") => tool_results(&message),
            Some("result") => vec![result_event(&message)],
            other => {
                debug!(message_type = ?other, "Ignoring Claude message");
                Vec::new()
            }
        }
    }
}

/// Tool results come back wrapped in a user message
fn tool_results(message: &Value) -> Vec<NormalizedEvent> {
    let Some(blocks) = message.pointer("/message/content").and_then(Value::as_array) else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| str_field(b, "type") == Some("tool_result"))
        .map(|b| {
            NormalizedEvent::tool_result(
                str_field(b, "tool_use_id").unwrap_or_default(),
                b.get("content").cloned().unwrap_or(Value::Null),
                b.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            )
        })
        .collect()
}

fn result_event(message: &Value) -> NormalizedEvent {
    let is_error = message.get("is_error").and_then(Value::as_bool).unwrap_or(false);
    let success = str_field(message, "subtype") == Some("success") && !is_error;
    let text = str_field(message, "result").map(str::to_string);
    if success {
        NormalizedEvent::explicit_result(OutcomeStatus::Success, text, None)
    } else {
        let error = text
            .or_else(|| {
                message
                    .get("errors")
                    .and_then(Value::as_array)
                    .map(|errs| {
                        errs.iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
                    .filter(|s| !s.is_empty())
            })
            .or_else(|| str_field(message, "subtype").map(str::to_string))
            .unwrap_or_else(|| "unknown error".to_string());
        NormalizedEvent::explicit_result(OutcomeStatus::Error, None, Some(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_keeps_session_id() {
        let events = ClaudeAdapter.translate(json!({
            "type": "system", "subtype": "init", "session_id": "sess-42", "model": "claude-sonnet"
        }));
        assert_eq!(events.len(), 1);
        assert!(events[0].is_init());
        assert_eq!(events[0].session_token().unwrap().as_str(), "sess-42");
        assert_eq!(events[0].payload["model"], "claude-sonnet");
        assert!(events[0].payload.get("type").is_none());
    }

    #[test]
    fn test_assistant_carries_blocks_and_stop_reason() {
        let events = ClaudeAdapter.translate(json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Creating the screen"},
                    {
                        "type": "tool_use", "id": "toolu_1", "name": "Write",
                        "input": {"file_path": "App.tsx"}
                    }
                ],
                "stop_reason": "tool_use"
            },
            "session_id": "sess-42"
        }));
        assert_eq!(events[0].kind, EventKind::Assistant);
        assert_eq!(events[0].text(), "Creating the screen");
        assert_eq!(events[0].stop_reason(), Some("tool_use"));
        assert_eq!(events[0].payload["message"]["content"][1]["name"], "Write");
    }

    #[test]
    fn test_tool_results_are_unwrapped_from_user_messages() {
        let events = ClaudeAdapter.translate(json!({
            "type": "user",
            "message": {"role": "user", "content": [
                {
                    "type": "tool_result", "tool_use_id": "toolu_1",
                    "content": "ok", "is_error": false
                },
                {
                    "type": "tool_result", "tool_use_id": "toolu_2",
                    "content": "denied", "is_error": true
                }
            ]}
        }));
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::ToolResult);
        assert_eq!(events[1].payload["tool_use_id"], "toolu_2");
        assert_eq!(events[1].payload["is_error"], true);
    }

    #[test]
    fn test_result_status_mapping() {
        let ok = ClaudeAdapter.translate(json!({
            "type": "result", "subtype": "success", "is_error": false, "result": "Done"
        }));
        assert_eq!(ok[0].result_status(), Some(OutcomeStatus::Success));
        assert_eq!(ok[0].payload["summary"], "Done");

        let flagged = ClaudeAdapter.translate(json!({
            "type": "result", "subtype": "success", "is_error": true, "result": "API Error: 529"
        }));
        assert_eq!(flagged[0].result_status(), Some(OutcomeStatus::Error));
        assert_eq!(flagged[0].error_text(), Some("API Error: 529"));

        let max_turns = ClaudeAdapter.translate(json!({
            "type": "result", "subtype": "error_max_turns", "is_error": true
        }));
        assert_eq!(max_turns[0].error_text(), Some("error_max_turns"));
    }

    #[test]
    fn test_unknown_messages_are_dropped() {
        assert!(ClaudeAdapter
            .translate(json!({"type": "stream_event", "event": {}}))
            .is_empty());
    }
}
