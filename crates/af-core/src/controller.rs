// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent execution controller
//!
//! This module prepares the sandbox for a backend, assembles the environment
//! bundle for one attempt and starts the driver detached. The caller gets a
//! handle back as soon as the pid is known and follows the log on its own.

use af_agents::AgentBackend;
use af_domain_types::{SessionToken, TurnRequest};
use af_event_store::ProjectStateStore;
use af_logging::redact;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::sandbox::{shell_quote, Sandbox, SandboxCommand};
use crate::{Error, Result};

/// What one launched process is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPlan {
    /// 1 for the first attempt, 2 for the retry after session loss
    pub attempt: u32,
    pub resume: Option<SessionToken>,
    pub system_instructions: Option<String>,
    pub user_message: String,
}

impl AttemptPlan {
    /// Resume iff the request carries a token; send instructions iff it does not
    pub fn first(request: &TurnRequest) -> Self {
        let system_instructions = match request.session_token {
            Some(_) => None,
            None => non_empty(&request.system_instructions),
        };
        Self {
            attempt: 1,
            resume: request.session_token.clone(),
            system_instructions,
            user_message: request.user_message.clone(),
        }
    }

    /// Fresh session with instructions resent and `message` replacing the user message
    pub fn fresh_retry(request: &TurnRequest, message: String) -> Self {
        Self {
            attempt: 2,
            resume: None,
            system_instructions: non_empty(&request.system_instructions),
            user_message: message,
        }
    }

    pub fn is_resume(&self) -> bool {
        self.resume.is_some()
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// A launched agent process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHandle {
    pub pid: u32,
    pub log_path: String,
    pub sandbox_id: String,
}

pub struct AgentController<'a> {
    backend: &'a dyn AgentBackend,
    config: &'a PipelineConfig,
}

impl<'a> AgentController<'a> {
    pub fn new(backend: &'a dyn AgentBackend, config: &'a PipelineConfig) -> Self {
        Self { backend, config }
    }

    fn provider_dir(&self) -> String {
        format!(
            "{}/{}",
            self.config.driver_dir.trim_end_matches('/'),
            self.backend.name()
        )
    }

    pub fn driver_path(&self) -> String {
        format!("{}/driver.sh", self.provider_dir())
    }

    /// Upload the driver and its helpers, then make sure the agent CLI exists
    pub async fn prepare(&self, sandbox: &dyn Sandbox) -> Result<()> {
        let dir = self.provider_dir();
        let driver = self.backend.driver();
        sandbox
            .write_file(&self.driver_path(), driver.contents.as_bytes(), true)
            .await
            .map_err(|e| Error::setup(format!("failed to upload {}: {}", driver.path, e)))?;
        for helper in self.backend.helpers() {
            let path = format!("{}/{}", dir, helper.path);
            sandbox
                .write_file(&path, helper.contents.as_bytes(), false)
                .await
                .map_err(|e| Error::setup(format!("failed to upload {}: {}", helper.path, e)))?;
        }

        let output = sandbox
            .run(SandboxCommand::new(self.backend.install_command()))
            .await
            .map_err(|e| Error::setup(format!("sandbox {} unreachable: {}", sandbox.id(), e)))?;
        if output.stdout.contains("already installed") {
            debug!(backend = self.backend.name(), "Agent CLI already installed");
        } else if output.success() {
            info!(backend = self.backend.name(), "Agent CLI installed");
        } else {
            // The image may ship the CLI under another name; let the launch decide.
            warn!(
                backend = self.backend.name(),
                exit_code = ?output.exit_code,
                "Agent CLI install failed: {}",
                output.stderr.trim()
            );
        }
        Ok(())
    }

    /// Environment bundle for one attempt
    pub fn environment(&self, request: &TurnRequest, plan: &AttemptPlan) -> Vec<(String, String)> {
        let mut env = Vec::new();

        for name in self.backend.credential_env() {
            match self.config.credential(name) {
                Some(value) => {
                    debug!(credential = name, value = %redact(&value), "Forwarding credential");
                    env.push((name.to_string(), value));
                }
                None => debug!(credential = name, "Credential not configured"),
            }
        }

        let endpoints = [
            ("AF_EVENT_STORE_URL", &self.config.event_store.url),
            ("AF_EVENT_STORE_KEY", &self.config.event_store.key),
            ("AF_OBJECT_STORE_URL", &self.config.object_store.url),
            ("AF_OBJECT_STORE_KEY", &self.config.object_store.key),
        ];
        for (name, value) in endpoints {
            if let Some(value) = value {
                env.push((name.to_string(), value.clone()));
            }
        }

        if let Some(instructions) = &plan.system_instructions {
            env.push(("AF_SYSTEM_INSTRUCTIONS".to_string(), instructions.clone()));
        }
        env.push(("AF_USER_MESSAGE".to_string(), plan.user_message.clone()));
        if let Some(token) = &plan.resume {
            env.push(("AF_SESSION_TOKEN".to_string(), token.as_str().to_string()));
        }
        env.push((
            "AF_WORKDIR".to_string(),
            request.working_dir.to_string_lossy().to_string(),
        ));
        env
    }

    /// Start the driver detached and record its pid
    pub async fn launch(
        &self,
        sandbox: &dyn Sandbox,
        state: &dyn ProjectStateStore,
        request: &TurnRequest,
        plan: &AttemptPlan,
        turn_id: &str,
    ) -> Result<AgentHandle> {
        let log_dir = self.config.log_dir.trim_end_matches('/');
        let log_path = format!(
            "{}/{}-{}-{}.log",
            log_dir, request.task_id, turn_id, plan.attempt
        );
        let script = launch_script(&self.driver_path(), log_dir, &log_path);

        let env = self.environment(request, plan);
        debug!(
            keys = ?env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            "Launch environment"
        );
        let output = sandbox
            .run(
                SandboxCommand::new(script)
                    .env(env)
                    .cwd(request.working_dir.to_string_lossy()),
            )
            .await
            .map_err(|e| Error::setup(format!("sandbox {} unreachable: {}", sandbox.id(), e)))?;

        let pid = output
            .stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                Error::setup(format!(
                    "launch did not report a pid (stdout: {:?}, stderr: {:?})",
                    output.stdout.trim(),
                    output.stderr.trim()
                ))
            })?;

        if let Err(e) = state.set_running(&request.task_id, pid).await {
            warn!(task_id = %request.task_id, pid, "Failed to record running pid: {}", e);
        }

        info!(
            task_id = %request.task_id,
            pid,
            attempt = plan.attempt,
            resume = plan.is_resume(),
            log = %log_path,
            "Agent launched"
        );
        Ok(AgentHandle {
            pid,
            log_path,
            sandbox_id: sandbox.id().to_string(),
        })
    }
}

/// Best-effort termination of an agent process
pub async fn stop_process(sandbox: &dyn Sandbox, pid: u32) -> Result<()> {
    info!(pid, sandbox = sandbox.id(), "Stopping agent process");
    sandbox.kill(pid).await
}

/// Detached wrapper around `driver`
///
/// The exit marker is renamed into place, so a reader never sees it
/// half written.
fn launch_script(driver: &str, log_dir: &str, log_path: &str) -> String {
    let exit_path = format!("{}.exit", log_path);
    let tmp_path = format!("{}.tmp", exit_path);
    let inner = format!(
        "{} > {} 2>&1; echo $? > {} && mv {} {}",
        shell_quote(driver),
        shell_quote(log_path),
        shell_quote(&tmp_path),
        shell_quote(&tmp_path),
        shell_quote(&exit_path)
    );
    format!(
        "mkdir -p {} && nohup sh -c {} >/dev/null 2>&1 & echo $!",
        shell_quote(log_dir),
        shell_quote(&inner)
    )
}
