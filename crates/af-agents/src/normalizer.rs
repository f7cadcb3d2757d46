// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Byte stream or SDK message stream into canonical events

use af_domain_types::NormalizedEvent;
use serde_json::Value;
use tracing::debug;

use crate::decoder::{DecodedLine, LineDecoder};
use crate::traits::ProtocolAdapter;

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutput {
    Event(NormalizedEvent),
    /// Output that could not be parsed; never fatal
    Diagnostic(String),
}

pub struct StreamNormalizer {
    decoder: LineDecoder,
    adapter: Box<dyn ProtocolAdapter>,
}

impl StreamNormalizer {
    pub fn new(adapter: Box<dyn ProtocolAdapter>) -> Self {
        Self {
            decoder: LineDecoder::new(),
            adapter,
        }
    }

    /// Feed a raw chunk of process output
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<AdapterOutput> {
        let lines = self.decoder.push(chunk);
        let mut out = Vec::new();
        for line in lines {
            self.dispatch(line, &mut out);
        }
        out
    }

    /// Feed an already-typed message from an SDK source
    pub fn push_message(&mut self, message: Value) -> Vec<AdapterOutput> {
        wrap(self.adapter.translate(message))
    }

    /// End of stream: flush the partial line, then the adapter's buffers
    pub fn finish(&mut self) -> Vec<AdapterOutput> {
        let mut out = Vec::new();
        if let Some(line) = self.decoder.finish() {
            self.dispatch(line, &mut out);
        }
        out.extend(wrap(self.adapter.finish()));
        out
    }

    fn dispatch(&mut self, line: DecodedLine, out: &mut Vec<AdapterOutput>) {
        match line {
            DecodedLine::Json(value) => out.extend(wrap(self.adapter.translate(value))),
            DecodedLine::Text(text) => {
                debug!(line = %text, "Non-JSON agent output");
                out.push(AdapterOutput::Diagnostic(text));
            }
        }
    }
}

fn wrap(events: Vec<NormalizedEvent>) -> Vec<AdapterOutput> {
    events.into_iter().map(AdapterOutput::Event).collect()
}
