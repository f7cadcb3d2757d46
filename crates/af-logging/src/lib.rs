// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Centralized logging utilities for App Forge
//!
//! Every binary initializes `tracing` through this crate so that filter
//! defaults, output formats and log file locations stay consistent. `RUST_LOG`
//! always takes precedence over the level chosen on the command line.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format, one object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Log level accepted on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

/// Logging arguments shared by every App Forge binary
///
/// Flatten into a clap struct with `#[command(flatten)]`. Output goes to the
/// console unless `--log-file` or `--log-dir` is given.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Log verbosity level (default: info)
    #[arg(long, value_enum, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    /// Log output format (default: plaintext)
    #[arg(long, value_enum, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    /// Directory for log files
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Log filename, relative to --log-dir unless absolute
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl CliLoggingArgs {
    /// Initialize the global subscriber for `component`
    ///
    /// ```rust,no_run
    /// use af_logging::CliLoggingArgs;
    /// use clap::Parser;
    ///
    /// #[derive(Parser)]
    /// struct Args {
    ///     #[command(flatten)]
    ///     logging: CliLoggingArgs,
    /// }
    ///
    /// fn main() -> anyhow::Result<()> {
    ///     Args::parse().logging.init("af")?;
    ///     Ok(())
    /// }
    /// ```
    pub fn init(self, component: &str) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or_default().into();
        let format = self.log_format.unwrap_or_default();

        if self.log_file.is_some() || self.log_dir.is_some() {
            let path = self.resolve_log_path(component);
            init_to_file(component, level, format, &path)
        } else {
            init_with_writer(component, level, format, io::stderr)
        }
    }

    /// Resolve the log file location from `--log-file` and `--log-dir`
    ///
    /// An absolute `--log-file` wins. A relative one is joined onto
    /// `--log-dir` when present. Without either, the platform default is used.
    pub fn resolve_log_path(&self, component: &str) -> PathBuf {
        match (&self.log_file, &self.log_dir) {
            (Some(file), _) if Path::new(file).is_absolute() => PathBuf::from(file),
            (Some(file), Some(dir)) => Path::new(dir).join(file),
            (Some(file), None) => PathBuf::from(file),
            (None, Some(dir)) => Path::new(dir).join(format!("{}.log", component)),
            (None, None) => standard_log_path(component),
        }
    }
}

/// Platform-specific default log path for a component
///
/// - Linux: `~/.local/share/app-forge/<component>.log`
/// - macOS: `~/Library/Logs/app-forge/<component>.log`
/// - Windows: `%APPDATA%\app-forge\<component>.log`
pub fn standard_log_path(component: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    let mut path = {
        let mut p = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        p.push("Library");
        p.push("Logs");
        p
    };

    #[cfg(not(target_os = "macos"))]
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    path.push("app-forge");
    path.push(format!("{}.log", component));
    path
}

/// Initialize logging to a file, creating parent directories as needed
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    init_with_writer(component, default_level, format, std::sync::Mutex::new(file))
}

/// Initialize logging with a custom writer
pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(component, default_level)));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Filter used when `RUST_LOG` is unset
///
/// Workspace crates log at `default_level`; everything else (hyper, reqwest,
/// rusqlite) is held at `warn` unless that is more verbose than requested.
fn default_directive(component: &str, default_level: Level) -> String {
    let deps = if default_level < Level::WARN {
        default_level
    } else {
        Level::WARN
    };
    let component = component.replace('-', "_");
    let mut directive = format!("{},{}={}", deps, component, default_level);
    for krate in ["af_core", "af_agents", "af_event_store"] {
        if krate != component {
            directive.push_str(&format!(",{}={}", krate, default_level));
        }
    }
    directive
}

/// Placeholder for credentials in log fields
///
/// ```rust
/// let api_key = "sk-ant-0123";
/// tracing::debug!(api_key = %af_logging::redact(api_key), "credential loaded");
/// ```
pub fn redact(_value: impl std::fmt::Display) -> &'static str {
    "[REDACTED]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact() {
        assert_eq!(redact("sk-secret"), "[REDACTED]");
    }

    #[test]
    fn test_cli_log_level_conversion() {
        assert_eq!(Level::from(CliLogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(CliLogLevel::Debug), Level::DEBUG);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
    }

    #[test]
    fn test_resolve_log_path() {
        let args = CliLoggingArgs {
            log_dir: Some("/var/log/af".into()),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("af"), PathBuf::from("/var/log/af/af.log"));

        let args = CliLoggingArgs {
            log_dir: Some("/var/log/af".into()),
            log_file: Some("turns.log".into()),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("af"), PathBuf::from("/var/log/af/turns.log"));

        let args = CliLoggingArgs {
            log_dir: Some("/var/log/af".into()),
            log_file: Some("/tmp/explicit.log".into()),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("af"), PathBuf::from("/tmp/explicit.log"));
    }

    #[test]
    fn test_standard_log_path_for_component() {
        let path = standard_log_path("af");
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("af.log"));
        assert!(path_str.contains("app-forge"));
    }

    #[test]
    fn test_default_directive_quiets_dependencies() {
        assert_eq!(
            default_directive("af-cli", Level::INFO),
            "WARN,af_cli=INFO,af_core=INFO,af_agents=INFO,af_event_store=INFO"
        );
        assert!(default_directive("af-cli", Level::ERROR).starts_with("ERROR,"));
    }
}
