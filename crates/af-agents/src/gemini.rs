// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Google Gemini CLI backend
//!
//! Gemini streams assistant text as many `delta` messages. The adapter folds
//! them into one assistant event, flushed by the next non-delta message or by
//! the end of the stream, so a single sentence costs one event-store write.

use af_domain_types::{NormalizedEvent, OutcomeStatus, Provider};
use serde_json::{json, Value};
use tracing::debug;

use crate::traits::{npm_install_command, str_field, AgentBackend, DriverScript, ProtocolAdapter};

pub const STOP_REASONS: &[&str] = &["STOP", "MAX_TOKENS"];
pub const SESSION_LOST_MARKERS: &[&str] = &["No session found", "Invalid session"];

#[derive(Debug, Default, Clone)]
pub struct GeminiBackend;

impl GeminiBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AgentBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn driver(&self) -> DriverScript {
        DriverScript {
            path: "driver.sh",
            contents: include_str!("../drivers/gemini.sh"),
        }
    }

    fn install_command(&self) -> String {
        npm_install_command("gemini", "@google/gemini-cli")
    }

    fn credential_env(&self) -> &'static [&'static str] {
        &["GEMINI_API_KEY", "GOOGLE_API_KEY"]
    }

    fn default_stop_reasons(&self) -> &'static [&'static str] {
        STOP_REASONS
    }

    fn default_session_lost_markers(&self) -> &'static [&'static str] {
        SESSION_LOST_MARKERS
    }

    fn adapter(&self) -> Box<dyn ProtocolAdapter> {
        Box::new(GeminiAdapter::default())
    }
}

#[derive(Debug, Default)]
pub struct GeminiAdapter {
    pending: Option<String>,
    /// Latest finish reason seen on the current delta run
    pending_stop: Option<String>,
}

impl GeminiAdapter {
    fn flush(&mut self) -> Option<NormalizedEvent> {
        let stop_reason = self.pending_stop.take();
        self.pending
            .take()
            .filter(|text| !text.is_empty())
            .map(|text| NormalizedEvent::assistant_text(text, stop_reason.as_deref()))
    }
}

fn finish_reason(message: &Value) -> Option<&str> {
    str_field(message, "finish_reason").or_else(|| str_field(message, "finishReason"))
}

impl ProtocolAdapter for GeminiAdapter {
    fn translate(&mut self, message: Value) -> Vec<NormalizedEvent> {
        let is_delta = message.get("delta").and_then(Value::as_bool).unwrap_or(false);
        let is_assistant = str_field(&message, "role") == Some("assistant");

        if str_field(&message, "type") == Some("message") && is_assistant && is_delta {
            let piece = str_field(&message, "content").unwrap_or_default();
            self.pending.get_or_insert_with(String::new).push_str(piece);
            if let Some(reason) = finish_reason(&message) {
                self.pending_stop = Some(reason.to_string());
            }
            return Vec::new();
        }

        // Any other message closes the current delta run.
        let mut events: Vec<NormalizedEvent> = self.flush().into_iter().collect();

        match str_field(&message, "type") {
            Some("init") => {
                let session_id = str_field(&message, "session_id").unwrap_or_default();
                let mut event = NormalizedEvent::system_init(session_id);
                if let Some(model) = message.get("model") {
                    event.payload["model"] = model.clone();
                }
                events.push(event);
            }
            Some("message") if is_assistant => {
                events.push(NormalizedEvent::assistant_text(
                    str_field(&message, "content").unwrap_or_default(),
                    finish_reason(&message),
                ));
            }
            // The pipeline records the user message itself.
            Some("message") => {}
            Some("tool_use") => events.push(NormalizedEvent::tool_use(
                str_field(&message, "tool_id").unwrap_or_default(),
                str_field(&message, "tool_name").unwrap_or_default(),
                message.get("parameters").cloned().unwrap_or_else(|| json!({})),
            )),
            Some("tool_result") => {
                let is_error = str_field(&message, "status") != Some("success");
                let content = message
                    .get("output")
                    .cloned()
                    .or_else(|| message.pointer("/error/message").cloned())
                    .unwrap_or(Value::Null);
                events.push(NormalizedEvent::tool_result(
                    str_field(&message, "tool_id").unwrap_or_default(),
                    content,
                    is_error,
                ));
            }
            Some("error") => events.push(NormalizedEvent::system_error(
                str_field(&message, "message").unwrap_or("unknown error"),
            )),
            Some("result") => {
                if str_field(&message, "status") == Some("success") {
                    events.push(NormalizedEvent::explicit_result(
                        OutcomeStatus::Success,
                        None,
                        None,
                    ));
                } else {
                    let error = message
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("gemini reported an error")
                        .to_string();
                    events.push(NormalizedEvent::explicit_result(
                        OutcomeStatus::Error,
                        None,
                        Some(error),
                    ));
                }
            }
            other => debug!(message_type = ?other, "Ignoring Gemini message"),
        }
        events
    }

    fn finish(&mut self) -> Vec<NormalizedEvent> {
        self.flush().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain_types::EventKind;

    fn delta(text: &str) -> Value {
        json!({"type": "message", "role": "assistant", "content": text, "delta": true})
    }

    #[test]
    fn test_deltas_flush_on_non_delta_event() {
        let mut adapter = GeminiAdapter::default();
        let mut events = Vec::new();
        for piece in ["a", "b", "c"] {
            events.extend(adapter.translate(delta(piece)));
        }
        assert!(events.is_empty());

        events.extend(adapter.translate(json!({
            "type": "tool_use", "tool_name": "write_file", "tool_id": "t-1",
            "parameters": {"file_path": "App.tsx"}
        })));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Assistant);
        assert_eq!(events[0].text(), "abc");
        assert_eq!(events[1].payload["message"]["content"][0]["type"], "tool_use");
        assert_eq!(events[1].payload["message"]["content"][0]["id"], "t-1");
        assert_eq!(events[1].payload["message"]["content"][0]["input"]["file_path"], "App.tsx");
    }

    #[test]
    fn test_deltas_flush_at_stream_end() {
        let mut adapter = GeminiAdapter::default();
        for piece in ["a", "b", "c"] {
            assert!(adapter.translate(delta(piece)).is_empty());
        }
        let events = adapter.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text(), "abc");
        assert!(adapter.finish().is_empty());
    }

    #[test]
    fn test_flushed_deltas_keep_final_finish_reason() {
        let mut adapter = GeminiAdapter::default();
        adapter.translate(delta("Hello "));
        adapter.translate(json!({
            "type": "message", "role": "assistant", "content": "world",
            "delta": true, "finishReason": "STOP"
        }));
        let events = adapter.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text(), "Hello world");
        assert_eq!(events[0].stop_reason(), Some("STOP"));
        assert!(STOP_REASONS.contains(&"STOP"));

        // The reason belongs to one run and does not leak into the next.
        adapter.translate(delta("again"));
        let next = adapter.finish();
        assert_eq!(next[0].stop_reason(), None);
    }

    #[test]
    fn test_user_echo_dropped_and_tool_result_mapped() {
        let mut adapter = GeminiAdapter::default();
        assert!(adapter
            .translate(json!({"type": "message", "role": "user", "content": "Say hello"}))
            .is_empty());
        let events = adapter.translate(json!({
            "type": "tool_result", "tool_id": "t-1", "status": "error",
            "error": {"type": "io", "message": "permission denied"}
        }));
        assert_eq!(events[0].kind, EventKind::ToolResult);
        assert_eq!(events[0].payload["is_error"], true);
        assert_eq!(events[0].payload["content"], "permission denied");
    }

    #[test]
    fn test_init_and_result() {
        let mut adapter = GeminiAdapter::default();
        let init = adapter.translate(json!({
            "type": "init", "session_id": "g-1", "model": "gemini-2.5-pro"
        }));
        assert_eq!(init[0].session_token().unwrap().as_str(), "g-1");
        assert_eq!(init[0].payload["model"], "gemini-2.5-pro");

        adapter.translate(delta("Hi"));
        let end = adapter.translate(json!({"type": "result", "status": "success", "stats": {}}));
        assert_eq!(end.len(), 2);
        assert_eq!(end[0].text(), "Hi");
        assert_eq!(end[1].result_status(), Some(OutcomeStatus::Success));
    }
}
