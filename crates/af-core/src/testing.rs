// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test doubles for the turn pipeline
//!
//! [`ScriptedSandbox`] replays canned agent output, one [`ScriptedAttempt`]
//! per launch, over an in-memory file tree. The counting triggers record how
//! often side effects fired.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::controller::AgentHandle;
use crate::sandbox::{CommandOutput, OutputChunk, Sandbox, SandboxCommand};
use crate::side_effects::{
    ReloadTrigger, SnapshotReceipt, SnapshotRequest, SnapshotTrigger, TriggerResult,
};
use crate::{Error, Result};

/// Exit code reported for a killed scripted process
pub const KILLED_EXIT_CODE: i32 = 143;

#[derive(Debug, Clone)]
enum Step {
    Data(Vec<u8>),
    Message(Value),
    Delay(Duration),
    Exit(Option<i32>),
    Hang,
}

/// Output of one scripted process
#[derive(Debug, Clone, Default)]
pub struct ScriptedAttempt {
    steps: Vec<Step>,
}

impl ScriptedAttempt {
    pub fn new() -> Self {
        Self::default()
    }

    /// One output line, newline appended
    pub fn line(mut self, line: impl Into<String>) -> Self {
        let mut bytes = line.into().into_bytes();
        bytes.push(b'\n');
        self.steps.push(Step::Data(bytes));
        self
    }

    pub fn json(self, value: Value) -> Self {
        self.line(value.to_string())
    }

    /// An already parsed protocol message
    pub fn message(mut self, value: Value) -> Self {
        self.steps.push(Step::Message(value));
        self
    }

    /// Bytes exactly as given, for split-line cases
    pub fn raw(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push(Step::Data(bytes.into()));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Delay(duration));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.steps.push(Step::Exit(Some(code)));
        self
    }

    /// Block until killed
    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    attempts: VecDeque<ScriptedAttempt>,
    running: HashMap<u32, Vec<Step>>,
    tokens: HashMap<u32, CancellationToken>,
    files: BTreeMap<String, Vec<u8>>,
    commands: Vec<SandboxCommand>,
    launches: Vec<SandboxCommand>,
    killed: Vec<u32>,
}

pub struct ScriptedSandbox {
    id: String,
    unreachable: bool,
    next_pid: AtomicU32,
    inner: Mutex<Inner>,
}

impl Default for ScriptedSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self {
            id: "scripted".to_string(),
            unreachable: false,
            next_pid: AtomicU32::new(4242),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Every command fails as if the sandbox were gone
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn with_attempt(self, attempt: ScriptedAttempt) -> Self {
        self.lock().attempts.push_back(attempt);
        self
    }

    pub fn with_file(self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.lock().files.insert(path.to_string(), contents.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the original failure.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn written_files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Launch commands, in order, with their environment
    pub fn launches(&self) -> Vec<SandboxCommand> {
        self.lock().launches.clone()
    }

    pub fn commands(&self) -> Vec<SandboxCommand> {
        self.lock().commands.clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.lock().killed.clone()
    }

    fn unreachable_error(&self) -> Error {
        Error::sandbox(format!("sandbox {} is unreachable", self.id))
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, command: SandboxCommand) -> Result<CommandOutput> {
        if self.unreachable {
            return Err(self.unreachable_error());
        }
        let mut inner = self.lock();
        inner.commands.push(command.clone());

        if command.script.contains("nohup") {
            let Some(attempt) = inner.attempts.pop_front() else {
                return Ok(CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "no scripted attempt left".to_string(),
                });
            };
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            inner.running.insert(pid, attempt.steps);
            inner.tokens.insert(pid, CancellationToken::new());
            inner.launches.push(command);
            return Ok(CommandOutput {
                exit_code: Some(0),
                stdout: format!("{}\n", pid),
                stderr: String::new(),
            });
        }

        let stdout = if command.script.contains("already installed") {
            "already installed\n".to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8], _executable: bool) -> Result<()> {
        if self.unreachable {
            return Err(self.unreachable_error());
        }
        self.lock().files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.lock().files.get(path).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path),
            ))
        })
    }

    async fn list_files(&self, root: &str, excludes: &[String]) -> Result<Vec<String>> {
        let prefix = format!("{}/", root.trim_end_matches('/'));
        Ok(self
            .lock()
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rel| {
                let mut parts: Vec<&str> = rel.split('/').collect();
                parts.pop();
                !parts.iter().any(|dir| excludes.iter().any(|e| e == dir))
            })
            .map(str::to_string)
            .collect())
    }

    fn follow_output(&self, handle: &AgentHandle) -> BoxStream<'static, OutputChunk> {
        let (steps, cancel) = {
            let mut inner = self.lock();
            (
                inner.running.remove(&handle.pid),
                inner.tokens.get(&handle.pid).cloned(),
            )
        };
        let (Some(steps), Some(cancel)) = (steps, cancel) else {
            return Box::pin(futures::stream::iter([OutputChunk::Exited(None)]));
        };

        Box::pin(async_stream::stream! {
            let mut exit = Some(0);
            for step in steps {
                if cancel.is_cancelled() {
                    exit = Some(KILLED_EXIT_CODE);
                    break;
                }
                match step {
                    Step::Data(bytes) => {
                        yield OutputChunk::Data(bytes);
                    }
                    Step::Message(value) => {
                        yield OutputChunk::Message(value);
                    }
                    Step::Delay(duration) => {
                        let killed = tokio::select! {
                            _ = tokio::time::sleep(duration) => false,
                            _ = cancel.cancelled() => true,
                        };
                        if killed {
                            exit = Some(KILLED_EXIT_CODE);
                            break;
                        }
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        exit = Some(KILLED_EXIT_CODE);
                        break;
                    }
                    Step::Exit(code) => {
                        exit = code;
                        break;
                    }
                }
            }
            yield OutputChunk::Exited(exit);
        })
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.killed.push(pid);
        if let Some(token) = inner.tokens.get(&pid) {
            token.cancel();
        }
        Ok(())
    }
}

/// Reload trigger counting its calls
#[derive(Debug, Default)]
pub struct CountingReload {
    calls: AtomicUsize,
    error: Option<String>,
}

impl CountingReload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            error: Some(error.into()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReloadTrigger for CountingReload {
    async fn reload(&self, _task_id: &str) -> TriggerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.error {
            Some(e) => TriggerResult::failed(e.clone()),
            None => TriggerResult::ok(),
        }
    }
}

/// Snapshot trigger counting its calls and handing out increasing versions
#[derive(Debug, Default)]
pub struct CountingSnapshot {
    calls: AtomicUsize,
    version: AtomicU64,
}

impl CountingSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotTrigger for CountingSnapshot {
    async fn snapshot(&self, sandbox: &dyn Sandbox, request: SnapshotRequest) -> SnapshotReceipt {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let file_count = sandbox
            .list_files(&request.source_dir, &[])
            .await
            .map(|f| f.len())
            .unwrap_or(0);
        SnapshotReceipt {
            success: true,
            version: Some(self.version.fetch_add(1, Ordering::SeqCst) + 1),
            file_count,
            error: None,
        }
    }
}
