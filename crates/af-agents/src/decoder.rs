// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Line-delimited JSON decoding with carry-over between reads

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Json(Value),
    /// Anything that is not a JSON object: stderr noise, banners, tracebacks
    Text(String),
}

/// Splits a byte stream into lines, keeping a partial line across chunks
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read; returns every line completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(decoded) = decode(&line) {
                lines.push(decoded);
            }
        }
        lines
    }

    /// Decode whatever is left once the stream ended without a newline
    pub fn finish(&mut self) -> Option<DecodedLine> {
        let rest = std::mem::take(&mut self.pending);
        decode(&rest)
    }
}

fn decode(raw: &[u8]) -> Option<DecodedLine> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => Some(DecodedLine::Json(value)),
        _ => Some(DecodedLine::Text(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_split_across_reads_is_reassembled() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(br#"{"type":"assis"#).is_empty());
        let lines = decoder.push(b"tant\",\"n\":1}\n{\"type\":\"result\"}\n");
        assert_eq!(
            lines,
            vec![
                DecodedLine::Json(json!({"type": "assistant", "n": 1})),
                DecodedLine::Json(json!({"type": "result"})),
            ]
        );
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_non_json_lines_become_text() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"Error: No conversation found with session ID: abc\r\n\n42\n");
        assert_eq!(
            lines,
            vec![
                DecodedLine::Text("Error: No conversation found with session ID: abc".into()),
                DecodedLine::Text("42".into()),
            ]
        );
    }

    #[test]
    fn test_finish_flushes_trailing_partial_line() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(br#"{"type":"result","subtype":"success"}"#).is_empty());
        assert_eq!(
            decoder.finish(),
            Some(DecodedLine::Json(json!({"type": "result", "subtype": "success"})))
        );
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let line = "{\"text\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(
            decoder.push(&line[split..]),
            vec![DecodedLine::Json(json!({"text": "héllo"}))]
        );
    }
}
