// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! OpenAI Codex CLI backend (`codex exec --json`)

use af_domain_types::{NormalizedEvent, OutcomeStatus, Provider};
use serde_json::{json, Value};
use tracing::debug;

use crate::traits::{npm_install_command, str_field, AgentBackend, DriverScript, ProtocolAdapter};

pub const SESSION_LOST_MARKERS: &[&str] = &["thread not found", "session not found"];

#[derive(Debug, Default, Clone)]
pub struct CodexBackend;

impl CodexBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AgentBackend for CodexBackend {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn provider(&self) -> Provider {
        Provider::Codex
    }

    fn driver(&self) -> DriverScript {
        DriverScript {
            path: "driver.sh",
            contents: include_str!("../drivers/codex.sh"),
        }
    }

    fn install_command(&self) -> String {
        npm_install_command("codex", "@openai/codex")
    }

    fn credential_env(&self) -> &'static [&'static str] {
        &["OPENAI_API_KEY", "OPENAI_BASE_URL"]
    }

    /// Codex reports turn completion explicitly and carries no stop reasons
    fn default_stop_reasons(&self) -> &'static [&'static str] {
        &[]
    }

    fn default_session_lost_markers(&self) -> &'static [&'static str] {
        SESSION_LOST_MARKERS
    }

    fn adapter(&self) -> Box<dyn ProtocolAdapter> {
        Box::new(CodexAdapter::default())
    }
}

#[derive(Debug, Default)]
pub struct CodexAdapter {
    last_message: Option<String>,
}

impl ProtocolAdapter for CodexAdapter {
    fn translate(&mut self, message: Value) -> Vec<NormalizedEvent> {
        match str_field(&message, "type") {
            Some("thread.started") => match str_field(&message, "thread_id") {
                Some(thread_id) => vec![NormalizedEvent::system_init(thread_id)],
                None => Vec::new(),
            },
            Some("item.completed") => match message.get("item") {
                Some(item) => self.translate_item(item),
                None => Vec::new(),
            },
            Some("turn.completed") => vec![NormalizedEvent::explicit_result(
                OutcomeStatus::Success,
                self.last_message.take(),
                None,
            )],
            Some("turn.failed") => {
                let error = message
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("turn failed")
                    .to_string();
                vec![NormalizedEvent::explicit_result(
                    OutcomeStatus::Error,
                    None,
                    Some(error),
                )]
            }
            // Top-level errors may be transient; `turn.failed` is the verdict.
            Some("error") => vec![NormalizedEvent::system_error(
                str_field(&message, "message").unwrap_or("unknown error"),
            )],
            other => {
                debug!(message_type = ?other, "Ignoring Codex message");
                Vec::new()
            }
        }
    }
}

impl CodexAdapter {
    fn translate_item(&mut self, item: &Value) -> Vec<NormalizedEvent> {
        let id = str_field(item, "id").unwrap_or_default();
        // Older CLI releases used `item_type`.
        let item_type = str_field(item, "type").or_else(|| str_field(item, "item_type"));
        let failed = str_field(item, "status") == Some("failed");

        match item_type {
            Some("agent_message") => {
                let text = str_field(item, "text").unwrap_or_default().to_string();
                self.last_message = Some(text.clone());
                vec![NormalizedEvent::assistant_text(text, None)]
            }
            Some("command_execution") => {
                let exit_code = item.get("exit_code").and_then(Value::as_i64);
                vec![
                    NormalizedEvent::tool_use(
                        id,
                        "command_execution",
                        json!({ "command": item.get("command").cloned().unwrap_or(Value::Null) }),
                    ),
                    NormalizedEvent::tool_result(
                        id,
                        item.get("aggregated_output").cloned().unwrap_or(Value::Null),
                        failed || exit_code.is_some_and(|c| c != 0),
                    ),
                ]
            }
            Some("file_change") => {
                let changes = item.get("changes").cloned().unwrap_or_else(|| json!([]));
                let summary = changes
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .map(|c| {
                                format!(
                                    "{} {}",
                                    str_field(c, "kind").unwrap_or("update"),
                                    str_field(c, "path").unwrap_or("?")
                                )
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                vec![
                    NormalizedEvent::tool_use(id, "file_change", json!({ "changes": changes })),
                    NormalizedEvent::tool_result(id, Value::String(summary), failed),
                ]
            }
            Some("mcp_tool_call") => {
                let name = format!(
                    "{}.{}",
                    str_field(item, "server").unwrap_or("mcp"),
                    str_field(item, "tool").unwrap_or("tool")
                );
                vec![
                    NormalizedEvent::tool_use(
                        id,
                        name,
                        item.get("arguments").cloned().unwrap_or_else(|| json!({})),
                    ),
                    NormalizedEvent::tool_result(
                        id,
                        item.get("result").cloned().unwrap_or(Value::Null),
                        failed,
                    ),
                ]
            }
            Some("web_search") => vec![
                NormalizedEvent::tool_use(
                    id,
                    "web_search",
                    json!({ "query": item.get("query").cloned().unwrap_or(Value::Null) }),
                ),
                NormalizedEvent::tool_result(id, Value::Null, false),
            ],
            Some("error") => vec![NormalizedEvent::system_error(
                str_field(item, "message").unwrap_or("unknown error"),
            )],
            other => {
                debug!(item_type = ?other, "Ignoring Codex item");
                Vec::new()
            }
        }
    }
}
