// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandbox abstraction
//!
//! A sandbox is the disposable machine running the agent and holding the
//! app's source tree. The pipeline only needs to run shell commands, move
//! files, follow a process log and signal a pid.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

use crate::controller::AgentHandle;
use crate::{Error, Result};

/// Shell command executed inside the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxCommand {
    pub script: String,
    pub env: Vec<(String, String)>,
    pub cwd: Option<String>,
}

impl SandboxCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One item of a followed process log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Data(Vec<u8>),
    /// A protocol message delivered already parsed, as SDK transports do
    Message(serde_json::Value),
    /// The process finished; `None` when the exit code could not be read
    Exited(Option<i32>),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Run a command to completion
    ///
    /// `Err` means the sandbox could not be reached at all; a command that
    /// ran and failed is reported through `CommandOutput::exit_code`.
    async fn run(&self, command: SandboxCommand) -> Result<CommandOutput>;

    async fn write_file(&self, path: &str, contents: &[u8], executable: bool) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Files below `root`, relative to it, skipping directories named in `excludes`
    async fn list_files(&self, root: &str, excludes: &[String]) -> Result<Vec<String>>;

    /// Stream the log of a launched process until it exits
    fn follow_output(&self, handle: &AgentHandle) -> BoxStream<'static, OutputChunk>;

    /// Send SIGTERM; a process that is already gone is not an error
    async fn kill(&self, pid: u32) -> Result<()>;
}

/// Quote a value for POSIX `sh`
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Sandbox backed by the local machine
///
/// Useful for development and for running the pipeline inside an already
/// isolated container. Paths are host paths.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    id: String,
    poll_interval: Duration,
}

impl LocalSandbox {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, command: SandboxCommand) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command.script);
        cmd.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::sandbox(format!("failed to run sh in {}: {}", self.id, e)))?;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8], executable: bool) -> Result<()> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        #[cfg(unix)]
        if executable {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        #[cfg(not(unix))]
        let _ = executable;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn list_files(&self, root: &str, excludes: &[String]) -> Result<Vec<String>> {
        let root = PathBuf::from(root);
        let excludes = excludes.to_vec();
        tokio::task::spawn_blocking(move || walk(&root, &excludes))
            .await
            .map_err(|e| Error::sandbox(format!("file listing task failed: {}", e)))?
    }

    fn follow_output(&self, handle: &AgentHandle) -> BoxStream<'static, OutputChunk> {
        let log_path = PathBuf::from(&handle.log_path);
        let exit_path = PathBuf::from(format!("{}.exit", handle.log_path));
        let interval = self.poll_interval;

        Box::pin(async_stream::stream! {
            let mut log: Option<tokio::fs::File> = None;
            let mut offset = 0u64;
            loop {
                // Read the marker first so no output written before it is missed.
                let exited = read_exit_marker(&exit_path).await;
                if log.is_none() {
                    log = tokio::fs::File::open(&log_path).await.ok();
                }
                if let Some(file) = log.as_mut() {
                    match read_from(file, offset).await {
                        Ok(bytes) if !bytes.is_empty() => {
                            trace!(new_bytes = bytes.len(), "Log grew");
                            offset += bytes.len() as u64;
                            yield OutputChunk::Data(bytes);
                        }
                        Ok(_) => {}
                        Err(e) => debug!(log = ?log_path, "Failed to read log: {}", e),
                    }
                }
                if let Some(code) = exited {
                    debug!(?code, log = ?log_path, "Process exit marker found");
                    yield OutputChunk::Exited(code);
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        // Signal the driver first so the wrapping shell still writes the exit marker.
        let script = format!(
            "pkill -TERM -P {pid} 2>/dev/null || kill -TERM {pid} 2>&1",
            pid = pid
        );
        let output = self.run(SandboxCommand::new(script)).await?;
        if !output.success() {
            debug!(
                pid,
                stdout = %output.stdout.trim(),
                "kill reported failure, process likely gone"
            );
        }
        Ok(())
    }
}

/// Exit code from a marker file; `None` while the marker is missing or empty
async fn read_exit_marker(path: &Path) -> Option<Option<i32>> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.parse::<i32>().ok())
}

/// Bytes appended to `file` past `offset`
async fn read_from(file: &mut tokio::fs::File, offset: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

fn walk(root: &Path, excludes: &[String]) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if !excludes.iter().any(|e| *e == name) {
                    stack.push(entry.path());
                }
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(root) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }
    files.sort();
    Ok(files)
}
