// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![cfg(all(feature = "claude", feature = "gemini"))]

use af_agents::{backend_for, AdapterOutput, StreamNormalizer};
use af_domain_types::{EventKind, NormalizedEvent, OutcomeStatus, Provider};
use proptest::prelude::*;
use serde_json::json;

const CLAUDE_TRANSCRIPT: &str = concat!(
    r#"{"type":"system","subtype":"init","session_id":"sess-1","tools":["Bash","Write"]}"#,
    "\n",
    r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hello! I'll set up the app."}],"stop_reason":null}}"#,
    "\n",
    "npm WARN deprecated inflight@1.0.6\n",
    r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}],"stop_reason":"tool_use"}}"#,
    "\n",
    r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"App.tsx","is_error":false}]}}"#,
    "\n",
    r#"{"type":"result","subtype":"success","is_error":false,"result":"Hello!","session_id":"sess-1"}"#,
);

fn normalize_in_chunks(provider: Provider, input: &[u8], cuts: &[usize]) -> Vec<AdapterOutput> {
    let backend = backend_for(provider).unwrap();
    let mut normalizer = StreamNormalizer::new(backend.adapter());
    let mut out = Vec::new();
    let mut start = 0;
    for &cut in cuts {
        out.extend(normalizer.push_chunk(&input[start..cut]));
        start = cut;
    }
    out.extend(normalizer.push_chunk(&input[start..]));
    out.extend(normalizer.finish());
    out
}

fn events(out: &[AdapterOutput]) -> Vec<&NormalizedEvent> {
    out.iter()
        .filter_map(|o| match o {
            AdapterOutput::Event(e) => Some(e),
            AdapterOutput::Diagnostic(_) => None,
        })
        .collect()
}

#[test]
fn claude_transcript_normalizes_with_diagnostics() {
    let out = normalize_in_chunks(Provider::Claude, CLAUDE_TRANSCRIPT.as_bytes(), &[]);
    assert_eq!(out.len(), 6);
    assert_eq!(
        out[2],
        AdapterOutput::Diagnostic("npm WARN deprecated inflight@1.0.6".into())
    );

    let events = events(&out);
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::System,
            EventKind::Assistant,
            EventKind::Assistant,
            EventKind::ToolResult,
            EventKind::Result,
        ]
    );
    // The transcript does not end with a newline; finish() must recover it.
    assert_eq!(events[4].result_status(), Some(OutcomeStatus::Success));
}

#[test]
fn sdk_messages_skip_line_decoding() {
    let backend = backend_for(Provider::Claude).unwrap();
    let mut normalizer = StreamNormalizer::new(backend.adapter());
    let out = normalizer.push_message(json!({
        "type": "assistant",
        "message": {
            "role": "assistant",
            "content": [{"type": "text", "text": "typed"}],
            "stop_reason": "end_turn"
        }
    }));
    let events = events(&out);
    assert_eq!(events[0].text(), "typed");
    assert_eq!(events[0].stop_reason(), Some("end_turn"));
}

#[test]
fn gemini_deltas_fold_into_one_event_at_stream_end() {
    let input = concat!(
        r#"{"type":"init","session_id":"g-1","model":"gemini-2.5-pro"}"#,
        "\n",
        r#"{"type":"message","role":"assistant","content":"a","delta":true}"#,
        "\n",
        r#"{"type":"message","role":"assistant","content":"b","delta":true}"#,
        "\n",
        r#"{"type":"message","role":"assistant","content":"c","delta":true}"#,
        "\n",
    );
    let out = normalize_in_chunks(Provider::Gemini, input.as_bytes(), &[10, 75]);
    let events = events(&out);
    assert_eq!(events.len(), 2);
    assert!(events[0].is_init());
    assert_eq!(events[1].kind, EventKind::Assistant);
    assert_eq!(events[1].text(), "abc");
}

proptest! {
    #[test]
    fn chunk_boundaries_do_not_change_output(
        mut cuts in proptest::collection::vec(0usize..CLAUDE_TRANSCRIPT.len(), 0..12)
    ) {
        cuts.sort_unstable();
        cuts.dedup();
        let whole = normalize_in_chunks(Provider::Claude, CLAUDE_TRANSCRIPT.as_bytes(), &[]);
        let split = normalize_in_chunks(Provider::Claude, CLAUDE_TRANSCRIPT.as_bytes(), &cuts);
        prop_assert_eq!(whole, split);
    }
}
