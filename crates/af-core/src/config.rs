// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pipeline configuration
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! then `AF_*` environment variables. Nested keys use `__` in variable names,
//! e.g. `AF_HISTORY__MAX_CHARS=8000` or `AF_RELOAD__URL=http://...`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use af_agents::AgentBackend;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineConfig {
    /// Time allowed between launch and the first byte of output
    pub watchdog_secs: u64,
    /// How often the local sandbox polls a process log
    pub poll_interval_ms: u64,
    /// Sandbox directory receiving driver scripts
    pub driver_dir: String,
    /// Sandbox directory receiving process logs
    pub log_dir: String,
    pub history: HistoryConfig,
    /// Credential values keyed by kebab-case env name (`anthropic-api-key`)
    pub credentials: BTreeMap<String, String>,
    pub event_store: EndpointConfig,
    pub object_store: ObjectStoreConfig,
    pub reload: ReloadConfig,
    pub snapshot: SnapshotConfig,
    pub bundle: BundleConfig,
    /// Overrides keyed by provider name
    pub providers: BTreeMap<String, ProviderOverrides>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watchdog_secs: 30,
            poll_interval_ms: 200,
            driver_dir: "/tmp/af/drivers".to_string(),
            log_dir: "/tmp/af/logs".to_string(),
            history: HistoryConfig::default(),
            credentials: BTreeMap::new(),
            event_store: EndpointConfig::default(),
            object_store: ObjectStoreConfig::default(),
            reload: ReloadConfig::default(),
            snapshot: SnapshotConfig::default(),
            bundle: BundleConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HistoryConfig {
    /// Upper bound for the whole rendered history block
    pub max_chars: usize,
    /// Longer assistant replies are cut and marked as truncated
    pub entry_max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_chars: 12_000,
            entry_max_chars: 1_500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EndpointConfig {
    pub url: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectStoreKind {
    #[default]
    Fs,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ObjectStoreConfig {
    pub kind: ObjectStoreKind,
    /// Root directory for the filesystem store
    pub root: String,
    pub url: Option<String>,
    pub key: Option<String>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            kind: ObjectStoreKind::Fs,
            root: "/tmp/af/objects".to_string(),
            url: None,
            key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReloadConfig {
    /// Bundler control endpoint; reload is a no-op when unset
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnapshotConfig {
    /// Directory names never included in a snapshot
    pub excludes: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            excludes: ["node_modules", ".git", ".expo", "dist", ".cache"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BundleConfig {
    pub enabled: bool,
    pub command: String,
    /// Export output, relative to the working directory
    pub output_dir: String,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "npx expo export --platform web --output-dir dist".to_string(),
            output_dir: "dist".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProviderOverrides {
    pub stop_reasons: Option<Vec<String>>,
    pub session_lost_markers: Option<Vec<String>>,
}

impl PipelineConfig {
    /// Load defaults, then `path` (if any), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let built = builder
            .add_source(
                config::Environment::with_prefix("AF")
                    .prefix_separator("_")
                    .separator("__")
                    .convert_case(config::Case::Kebab)
                    .try_parsing(true),
            )
            .build()?;
        Ok(built.try_deserialize()?)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Configured stop reasons for a backend, or its defaults
    pub fn stop_reasons_for(&self, backend: &dyn AgentBackend) -> Vec<String> {
        self.providers
            .get(backend.name())
            .and_then(|o| o.stop_reasons.clone())
            .unwrap_or_else(|| to_owned(backend.default_stop_reasons()))
    }

    pub fn session_lost_markers_for(&self, backend: &dyn AgentBackend) -> Vec<String> {
        self.providers
            .get(backend.name())
            .and_then(|o| o.session_lost_markers.clone())
            .unwrap_or_else(|| to_owned(backend.default_session_lost_markers()))
    }

    /// Credential value for an environment variable name
    ///
    /// Configured values win over the orchestrator's own environment.
    pub fn credential(&self, env_name: &str) -> Option<String> {
        let key = env_name.to_lowercase().replace('_', "-");
        self.credentials
            .get(&key)
            .cloned()
            .or_else(|| std::env::var(env_name).ok())
            .filter(|v| !v.is_empty())
    }
}

fn to_owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults_without_sources() {
        let config = PipelineConfig::load(None).unwrap();
        assert_eq!(config.watchdog_secs, 30);
        assert_eq!(config.history.entry_max_chars, 1_500);
        assert!(config.snapshot.excludes.contains(&"node_modules".to_string()));
    }

    #[test]
    #[serial]
    fn test_file_then_env_precedence() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
watchdog-secs = 45

[history]
max-chars = 4000

[providers.claude]
stop-reasons = ["end_turn"]

[credentials]
anthropic-api-key = "from-file"
"#
        )
        .unwrap();

        std::env::set_var("AF_WATCHDOG_SECS", "12");
        let config = PipelineConfig::load(Some(file.path()));
        std::env::remove_var("AF_WATCHDOG_SECS");
        let config = config.unwrap();

        assert_eq!(config.watchdog_secs, 12);
        assert_eq!(config.history.max_chars, 4000);
        assert_eq!(config.history.entry_max_chars, 1_500);
        assert_eq!(config.credential("ANTHROPIC_API_KEY").as_deref(), Some("from-file"));

        let claude = af_agents::backend_for(af_domain_types::Provider::Claude).unwrap();
        assert_eq!(config.stop_reasons_for(claude.as_ref()), vec!["end_turn".to_string()]);
        assert_eq!(
            config.session_lost_markers_for(claude.as_ref()),
            vec!["No conversation found".to_string()]
        );
    }
}
