// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! AI coding agent backends for App Forge
//!
//! Each backend bundles a sandbox driver script, its credential set, its
//! completion vocabulary and a protocol adapter that turns its output into
//! canonical events.
//!
//! # Features
//!
//! - `claude` - Claude Code (stream-json)
//! - `codex` - OpenAI Codex CLI (`exec --json`)
//! - `gemini` - Google Gemini CLI (delta messages)
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "claude")]
//! # {
//! use af_agents::{backend_for, AdapterOutput, StreamNormalizer};
//! use af_domain_types::Provider;
//!
//! let backend = backend_for(Provider::Claude).unwrap();
//! let mut normalizer = StreamNormalizer::new(backend.adapter());
//! let line = br#"{"type":"system","subtype":"init","session_id":"s-1"}"#;
//! let mut out = normalizer.push_chunk(line);
//! out.extend(normalizer.push_chunk(b"\n"));
//! assert!(matches!(&out[0], AdapterOutput::Event(e) if e.is_init()));
//! # }
//! ```

pub mod decoder;
pub mod normalizer;
pub mod traits;

#[cfg(feature = "claude")]
pub mod claude;

#[cfg(feature = "codex")]
pub mod codex;

#[cfg(feature = "gemini")]
pub mod gemini;

pub use decoder::{DecodedLine, LineDecoder};
pub use normalizer::{AdapterOutput, StreamNormalizer};
pub use traits::{
    AgentBackend, AgentError, AgentResult, DriverScript, ProtocolAdapter, COMMON_HELPER,
};

use af_domain_types::Provider;

/// Select the backend for a provider
///
/// This is a pure mapping: one provider, one backend.
pub fn backend_for(provider: Provider) -> AgentResult<Box<dyn AgentBackend>> {
    match provider {
        #[cfg(feature = "claude")]
        Provider::Claude => Ok(Box::new(claude::ClaudeBackend::new())),

        #[cfg(feature = "codex")]
        Provider::Codex => Ok(Box::new(codex::CodexBackend::new())),

        #[cfg(feature = "gemini")]
        Provider::Gemini => Ok(Box::new(gemini::GeminiBackend::new())),

        #[allow(unreachable_patterns)]
        other => Err(AgentError::BackendDisabled(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn compiled_backends() -> Vec<Box<dyn AgentBackend>> {
        Provider::iter().filter_map(|p| backend_for(p).ok()).collect()
    }

    #[test]
    fn test_backend_for_maps_provider() {
        let backends = compiled_backends();
        assert!(!backends.is_empty());
        for backend in backends {
            let provider = backend.provider();
            assert_eq!(backend.name(), provider.as_str());
            assert!(backend.driver().contents.contains("common.sh"));
            assert!(!backend.credential_env().is_empty());
        }
    }

    #[cfg(feature = "claude")]
    #[test]
    fn test_claude_backend_is_compiled_in() {
        assert_eq!(backend_for(Provider::Claude).unwrap().provider(), Provider::Claude);
    }

    #[test]
    fn test_install_command_reports_existing_binary() {
        for backend in compiled_backends() {
            let cmd = backend.install_command();
            assert!(cmd.contains("already installed"));
            assert!(cmd.contains("npm install -g"));
        }
    }
}
