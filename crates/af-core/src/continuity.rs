// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session capture and recovery after a lost session
//!
//! [`SessionTracker`] stamps canonical events with the backend's session
//! token. When a resumed session turns out not to exist anymore, the prior
//! turns are rendered from the event log into a bounded history block that is
//! prepended to the message of the single fresh retry.

use af_domain_types::{CanonicalEvent, EventKind, NormalizedEvent, SessionToken};
use serde::Serialize;
use tracing::debug;

use crate::config::HistoryConfig;

pub const TRUNCATION_MARKER: &str = "[…truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NoSession,
    Active,
    /// The backend rejected the resume token
    Lost,
    /// The attempt's process is gone
    Cleared,
}

/// Per-attempt session bookkeeping
///
/// Events observed before the token is known are held back and released,
/// stamped, once it is captured.
#[derive(Debug)]
pub struct SessionTracker {
    task_id: String,
    turn_id: String,
    state: SessionState,
    token: Option<SessionToken>,
    unpersisted: bool,
    pending: Vec<NormalizedEvent>,
}

impl SessionTracker {
    /// `resuming` starts optimistically in [`SessionState::Active`]
    pub fn new(task_id: impl Into<String>, turn_id: impl Into<String>, resuming: bool) -> Self {
        Self {
            task_id: task_id.into(),
            turn_id: turn_id.into(),
            state: if resuming {
                SessionState::Active
            } else {
                SessionState::NoSession
            },
            token: None,
            unpersisted: false,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    /// Track one event, returning the events now ready for the log
    pub fn observe(&mut self, event: NormalizedEvent) -> Vec<CanonicalEvent> {
        if self.token.is_none() {
            if let Some(token) = event.session_token() {
                debug!(task_id = %self.task_id, session = %token, "Session token captured");
                self.token = Some(token);
                self.unpersisted = true;
                if self.state == SessionState::NoSession {
                    self.state = SessionState::Active;
                }
                let mut ready: Vec<CanonicalEvent> = std::mem::take(&mut self.pending)
                    .into_iter()
                    .map(|e| self.stamp(e))
                    .collect();
                ready.push(self.stamp(event));
                return ready;
            }
            self.pending.push(event);
            return Vec::new();
        }
        vec![self.stamp(event)]
    }

    /// The captured token, handed out once so it is persisted once
    pub fn take_unpersisted(&mut self) -> Option<SessionToken> {
        if self.unpersisted {
            self.unpersisted = false;
            self.token.clone()
        } else {
            None
        }
    }

    pub fn mark_lost(&mut self) {
        self.state = SessionState::Lost;
    }

    /// End of attempt: release anything still held back, untagged
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        if self.state != SessionState::Lost {
            self.state = SessionState::Cleared;
        }
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|e| self.stamp(e))
            .collect()
    }

    fn stamp(&self, event: NormalizedEvent) -> CanonicalEvent {
        CanonicalEvent::from_normalized(
            self.task_id.clone(),
            self.turn_id.clone(),
            self.token.clone(),
            event,
        )
    }
}

/// Whether backend output says the resumed session does not exist
pub fn is_session_lost(text: &str, markers: &[String]) -> bool {
    let text = text.to_lowercase();
    markers
        .iter()
        .any(|m| !m.is_empty() && text.contains(&m.to_lowercase()))
}

fn truncate_entry(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let kept: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{kept}{TRUNCATION_MARKER}")
    } else {
        kept
    }
}

/// Render prior user/assistant turns of a task into a bounded block
///
/// Events of `current_turn_id` are skipped. When the block exceeds
/// `max_chars` the oldest entries go first. Returns `None` when nothing
/// remains.
pub fn render_history(
    events: &[CanonicalEvent],
    current_turn_id: &str,
    config: &HistoryConfig,
) -> Option<String> {
    let mut entries: Vec<String> = events
        .iter()
        .filter(|e| e.turn_id != current_turn_id)
        .filter_map(|e| {
            let role = match e.kind {
                EventKind::User => "User",
                EventKind::Assistant => "Assistant",
                _ => return None,
            };
            let text = e.as_normalized().text();
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            let text = match e.kind {
                EventKind::Assistant => truncate_entry(text, config.entry_max_chars),
                _ => text.to_string(),
            };
            Some(format!("{}:\n{}\n\n", role, text))
        })
        .collect();

    let mut total: usize = entries.iter().map(|e| e.chars().count()).sum();
    let mut dropped = 0;
    while total > config.max_chars && !entries.is_empty() {
        total -= entries.remove(0).chars().count();
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "Oldest history entries dropped to fit the budget");
    }

    (!entries.is_empty()).then(|| entries.concat())
}

/// Message for the fresh-session retry
pub fn compose_retry_message(history: Option<&str>, user_message: &str) -> String {
    match history {
        Some(history) => format!(
            "## Prior conversation (session was reset)\n\n{history}## Current message\n\n{user_message}"
        ),
        None => user_message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(turn: &str, event: NormalizedEvent) -> CanonicalEvent {
        CanonicalEvent::from_normalized("task-1", turn, None, event)
    }

    #[test]
    fn test_pre_capture_events_are_stamped_at_capture() {
        let mut tracker = SessionTracker::new("task-1", "turn-1", false);
        assert!(tracker.observe(NormalizedEvent::user_text("hi")).is_empty());
        assert_eq!(tracker.state(), SessionState::NoSession);

        let ready = tracker.observe(NormalizedEvent::system_init("sess-1"));
        assert_eq!(ready.len(), 2);
        assert!(ready
            .iter()
            .all(|e| e.session_token == Some(SessionToken::new("sess-1"))));
        assert_eq!(ready[0].kind, EventKind::User);
        assert_eq!(tracker.state(), SessionState::Active);

        assert_eq!(tracker.take_unpersisted(), Some(SessionToken::new("sess-1")));
        assert_eq!(tracker.take_unpersisted(), None);

        // A later init does not replace the captured token.
        let ready = tracker.observe(NormalizedEvent::system_init("sess-2"));
        assert_eq!(ready[0].session_token, Some(SessionToken::new("sess-1")));
    }

    #[test]
    fn test_uncaptured_events_flush_untagged() {
        let mut tracker = SessionTracker::new("task-1", "turn-1", false);
        tracker.observe(NormalizedEvent::assistant_text("partial", None));
        let flushed = tracker.finish();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].session_token, None);
        assert_eq!(tracker.state(), SessionState::Cleared);
    }

    #[test]
    fn test_session_lost_markers_are_case_insensitive() {
        let markers = vec!["No conversation found".to_string()];
        assert!(is_session_lost(
            "Error: no conversation found with session ID: abc",
            &markers
        ));
        assert!(!is_session_lost("Conversation resumed", &markers));
        assert!(!is_session_lost("anything", &[String::new()]));
    }

    #[test]
    fn test_render_history_skips_current_turn_and_tools() {
        let events = vec![
            canonical("t1", NormalizedEvent::user_text("Build a todo app")),
            canonical("t1", NormalizedEvent::tool_use("toolu_1", "Bash", serde_json::json!({}))),
            canonical("t1", NormalizedEvent::assistant_text("Done, added a list.", None)),
            canonical("t2", NormalizedEvent::user_text("Current message")),
        ];
        let history = render_history(&events, "t2", &HistoryConfig::default()).unwrap();
        assert_eq!(
            history,
            "User:\nBuild a todo app\n\nAssistant:\nDone, added a list.\n\n"
        );
    }

    #[test]
    fn test_render_history_truncates_long_replies() {
        let config = HistoryConfig {
            max_chars: 10_000,
            entry_max_chars: 5,
        };
        let events = vec![canonical("t1", NormalizedEvent::assistant_text("abcdefghij", None))];
        let history = render_history(&events, "t2", &config).unwrap();
        assert!(history.contains("abcde[…truncated]"));
    }

    #[test]
    fn test_render_history_drops_oldest_over_budget() {
        let config = HistoryConfig {
            max_chars: 40,
            entry_max_chars: 1_000,
        };
        let events = vec![
            canonical("t1", NormalizedEvent::user_text("first message here")),
            canonical("t2", NormalizedEvent::user_text("second message")),
            canonical("t3", NormalizedEvent::user_text("third")),
        ];
        let history = render_history(&events, "t4", &config).unwrap();
        assert!(!history.contains("first"));
        assert!(history.contains("second"));
        assert!(history.contains("third"));
        assert!(history.chars().count() <= 40);

        assert!(render_history(&[], "t1", &config).is_none());
    }

    #[test]
    fn test_compose_retry_message() {
        let msg = compose_retry_message(Some("User:\nhi\n\n"), "Add dark mode");
        assert!(msg.starts_with("## Prior conversation"));
        assert!(msg.ends_with("## Current message\n\nAdd dark mode"));
        assert_eq!(compose_retry_message(None, "Add dark mode"), "Add dark mode");
    }
}
