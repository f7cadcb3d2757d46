// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Turn orchestration
//!
//! One call to [`TurnRunner::run_turn`] takes a user message to exactly one
//! terminal outcome. The agent's output is read in a single select loop over
//! the sandbox output stream, the first-output watchdog and the stop signal.
//! Every canonical event goes through one ordered append queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use af_agents::{AdapterOutput, AgentBackend, StreamNormalizer};
use af_domain_types::{
    EventKind, NormalizedEvent, OutcomeSource, SessionToken, SideEffectRun, TurnId, TurnOutcome,
    TurnRequest,
};
use af_event_store::{AppendQueue, AppendStats, Store};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::completion::CompletionDetector;
use crate::config::PipelineConfig;
use crate::continuity::{
    compose_retry_message, is_session_lost, render_history, SessionState, SessionTracker,
};
use crate::controller::{stop_process, AgentController, AgentHandle, AttemptPlan};
use crate::sandbox::{OutputChunk, Sandbox};
use crate::side_effects::{SideEffectContext, SideEffects};
use crate::Result;

/// How long a stopped process gets to report its exit
const KILL_GRACE: Duration = Duration::from_secs(5);

const DESCRIPTION_MAX_CHARS: usize = 200;

/// What a finished turn produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub task_id: String,
    pub turn_id: String,
    pub outcome: TurnOutcome,
    pub session_token: Option<SessionToken>,
    pub attempts: u32,
    pub append_stats: AppendStats,
    pub side_effect_runs: Vec<SideEffectRun>,
}

enum Signal {
    Cancel,
    Watchdog,
    Grace,
    Chunk(Option<OutputChunk>),
}

/// Per-turn state shared by its attempts
struct TurnContext {
    request: TurnRequest,
    turn_id: String,
    sandbox: Arc<dyn Sandbox>,
    queue: AppendQueue,
    detector: CompletionDetector,
    markers: Vec<String>,
    session_token: Option<SessionToken>,
    side_effects: Option<JoinHandle<Vec<SideEffectRun>>>,
}

pub struct TurnRunner<S: Store + 'static> {
    store: Arc<S>,
    config: Arc<PipelineConfig>,
    side_effects: SideEffects,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl<S: Store + 'static> TurnRunner<S> {
    /// Runner with the side effects described by `config`
    pub fn new(store: Arc<S>, config: PipelineConfig) -> Result<Self> {
        let side_effects = SideEffects::from_config(&config, store.clone())?;
        Ok(Self::with_side_effects(store, config, side_effects))
    }

    pub fn with_side_effects(
        store: Arc<S>,
        config: PipelineConfig,
        side_effects: SideEffects,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            side_effects,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if self
            .active()
            .insert(task_id.to_string(), token.clone())
            .is_some()
        {
            warn!(task_id, "Another turn was registered for this task");
        }
        token
    }

    fn unregister(&self, task_id: &str) {
        self.active().remove(task_id);
    }

    /// Run one user turn to its terminal outcome
    ///
    /// Fails only when the sandbox or the backend is unusable before the
    /// first process starts. Every other failure ends up in the outcome.
    pub async fn run_turn(
        &self,
        sandbox: Arc<dyn Sandbox>,
        request: TurnRequest,
    ) -> Result<TurnReport> {
        let turn_id = TurnId::generate();
        let task_id = request.task_id.clone();
        let span = info_span!(
            "turn",
            task_id = %request.task_id,
            turn_id = %turn_id,
            provider = %request.provider
        );
        let cancel = self.register(&task_id);
        let result = self
            .execute(sandbox, request, turn_id.to_string(), cancel)
            .instrument(span)
            .await;
        self.unregister(&task_id);
        result
    }

    /// Request a running turn of `task_id` to stop
    ///
    /// The request is also recorded in the store, so a turn followed by
    /// another runner sees it when its process exits. Returns whether a
    /// process was signalled.
    pub async fn stop(&self, sandbox: &dyn Sandbox, task_id: &str) -> Result<bool> {
        let token = self.active().get(task_id).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        if let Err(e) = self.store.request_stop(task_id).await {
            warn!(task_id, "Failed to record stop request: {}", e);
        }
        let state = self.store.load(task_id).await?;
        match state.running_pid {
            Some(pid) => {
                stop_process(sandbox, pid).await?;
                Ok(true)
            }
            None => {
                debug!(task_id, "No running process to stop");
                Ok(false)
            }
        }
    }

    async fn execute(
        &self,
        sandbox: Arc<dyn Sandbox>,
        request: TurnRequest,
        turn_id: String,
        cancel: CancellationToken,
    ) -> Result<TurnReport> {
        let backend = af_agents::backend_for(request.provider)?;
        let mut ctx = TurnContext {
            turn_id,
            sandbox,
            queue: AppendQueue::spawn(self.store.clone()),
            detector: CompletionDetector::new(self.config.stop_reasons_for(backend.as_ref())),
            markers: self.config.session_lost_markers_for(backend.as_ref()),
            session_token: request.session_token.clone(),
            side_effects: None,
            request,
        };
        info!(resume = ctx.session_token.is_some(), "Turn started");

        let first = AttemptPlan::first(&ctx.request);
        let mut tracker =
            SessionTracker::new(&ctx.request.task_id, &ctx.turn_id, first.is_resume());
        let user_event = NormalizedEvent::user_text(ctx.request.user_message.clone());
        self.persist(&mut ctx, &mut tracker, user_event).await;

        let controller = AgentController::new(backend.as_ref(), &self.config);
        if let Err(e) = controller.prepare(ctx.sandbox.as_ref()).await {
            return self.abort(ctx, tracker, e).await;
        }

        let mut attempts = 1;
        match self
            .run_attempt(&mut ctx, backend.as_ref(), &mut tracker, &first, &cancel)
            .await
        {
            Err(e) => return self.abort(ctx, tracker, e).await,
            Ok(SessionState::Lost) => {
                attempts = 2;
                self.flush(&mut ctx, &mut tracker);
                let retry = self.retry_plan(&mut ctx).await;
                tracker = SessionTracker::new(&ctx.request.task_id, &ctx.turn_id, false);
                let failure = match self
                    .run_attempt(&mut ctx, backend.as_ref(), &mut tracker, &retry, &cancel)
                    .await
                {
                    Ok(SessionState::Lost) => Some("session lost again on retry".to_string()),
                    Ok(_) => None,
                    Err(e) => Some(format!("retry failed to launch: {}", e)),
                };
                if let Some(detail) = failure {
                    warn!("Retry failed: {}", detail);
                    if let Some(outcome) = ctx.detector.on_retry_failed(detail) {
                        self.apply_outcome(&mut ctx, &mut tracker, outcome, true).await;
                    }
                }
            }
            Ok(_) => {}
        }

        if let Some(outcome) = ctx.detector.on_process_exit(None) {
            warn!("Attempts ended without a verdict, recording exit fallback");
            self.apply_outcome(&mut ctx, &mut tracker, outcome, true).await;
        }
        self.flush(&mut ctx, &mut tracker);
        self.finish(ctx, attempts).await
    }

    /// Launch one attempt and follow it to its end
    ///
    /// Returns the session state the attempt left behind.
    async fn run_attempt(
        &self,
        ctx: &mut TurnContext,
        backend: &dyn AgentBackend,
        tracker: &mut SessionTracker,
        plan: &AttemptPlan,
        cancel: &CancellationToken,
    ) -> Result<SessionState> {
        let controller = AgentController::new(backend, &self.config);
        let handle = controller
            .launch(
                ctx.sandbox.as_ref(),
                self.store.as_ref(),
                &ctx.request,
                plan,
                &ctx.turn_id,
            )
            .await?;

        self.follow(ctx, backend, tracker, plan, cancel, &handle).await;

        if let Err(e) = self.store.clear_running(&ctx.request.task_id).await {
            warn!(pid = handle.pid, "Failed to clear running pid: {}", e);
        }
        let state = tracker.state();
        debug!(pid = handle.pid, attempt = plan.attempt, ?state, "Attempt ended");
        Ok(state)
    }

    async fn follow(
        &self,
        ctx: &mut TurnContext,
        backend: &dyn AgentBackend,
        tracker: &mut SessionTracker,
        plan: &AttemptPlan,
        cancel: &CancellationToken,
        handle: &AgentHandle,
    ) {
        let mut normalizer = StreamNormalizer::new(backend.adapter());
        let mut output = ctx.sandbox.follow_output(handle);
        let watchdog = tokio::time::sleep(self.config.watchdog());
        tokio::pin!(watchdog);
        let grace = tokio::time::sleep(KILL_GRACE);
        tokio::pin!(grace);
        let mut seen_output = false;
        let mut stopping = false;

        loop {
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopping => Signal::Cancel,
                _ = &mut watchdog, if !seen_output && !stopping => Signal::Watchdog,
                _ = &mut grace, if stopping => Signal::Grace,
                chunk = output.next() => Signal::Chunk(chunk),
            };

            match signal {
                Signal::Cancel => {
                    info!(pid = handle.pid, "Stop requested");
                    ctx.detector.arm_cancel();
                    stopping = true;
                    grace.as_mut().reset(Instant::now() + KILL_GRACE);
                    if let Err(e) = stop_process(ctx.sandbox.as_ref(), handle.pid).await {
                        warn!(pid = handle.pid, "Failed to signal agent: {}", e);
                    }
                }
                Signal::Watchdog => {
                    let secs = self.config.watchdog_secs;
                    warn!(pid = handle.pid, "No agent output within {}s, killing", secs);
                    if let Some(outcome) = ctx.detector.on_watchdog(secs) {
                        self.apply_outcome(ctx, tracker, outcome, true).await;
                    }
                    if let Err(e) = stop_process(ctx.sandbox.as_ref(), handle.pid).await {
                        warn!(pid = handle.pid, "Failed to kill silent agent: {}", e);
                    }
                    return;
                }
                Signal::Grace => {
                    warn!(pid = handle.pid, "Stopped agent did not report its exit");
                    return self.on_exit(ctx, tracker, &mut normalizer, plan, None).await;
                }
                Signal::Chunk(Some(OutputChunk::Data(bytes))) => {
                    seen_output |= !bytes.is_empty();
                    let outputs = normalizer.push_chunk(&bytes);
                    if self.route(ctx, tracker, plan, handle, outputs).await {
                        return;
                    }
                }
                Signal::Chunk(Some(OutputChunk::Message(message))) => {
                    seen_output = true;
                    let outputs = normalizer.push_message(message);
                    if self.route(ctx, tracker, plan, handle, outputs).await {
                        return;
                    }
                }
                Signal::Chunk(Some(OutputChunk::Exited(code))) => {
                    return self.on_exit(ctx, tracker, &mut normalizer, plan, code).await;
                }
                Signal::Chunk(None) => {
                    return self.on_exit(ctx, tracker, &mut normalizer, plan, None).await;
                }
            }
        }
    }

    /// Handle the outputs of one chunk; returns true once the session is lost
    async fn route(
        &self,
        ctx: &mut TurnContext,
        tracker: &mut SessionTracker,
        plan: &AttemptPlan,
        handle: &AgentHandle,
        outputs: Vec<AdapterOutput>,
    ) -> bool {
        for out in outputs {
            if self.handle_output(ctx, tracker, plan, out).await {
                if let Err(e) = stop_process(ctx.sandbox.as_ref(), handle.pid).await {
                    debug!(pid = handle.pid, "Failed to kill lost attempt: {}", e);
                }
                return true;
            }
        }
        false
    }

    async fn on_exit(
        &self,
        ctx: &mut TurnContext,
        tracker: &mut SessionTracker,
        normalizer: &mut StreamNormalizer,
        plan: &AttemptPlan,
        exit_code: Option<i32>,
    ) {
        for out in normalizer.finish() {
            if self.handle_output(ctx, tracker, plan, out).await {
                return;
            }
        }
        info!(?exit_code, "Agent process exited");
        self.check_stop_request(ctx).await;
        if let Some(outcome) = ctx.detector.on_process_exit(exit_code) {
            self.apply_outcome(ctx, tracker, outcome, true).await;
        }
    }

    /// Arm cancellation when a stop was requested through the store
    async fn check_stop_request(&self, ctx: &mut TurnContext) {
        if ctx.detector.is_cancel_armed() {
            return;
        }
        match self.store.load(&ctx.request.task_id).await {
            Ok(state) if state.stop_requested => {
                info!("Stop was requested by another runner");
                ctx.detector.arm_cancel();
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to check for a stop request: {}", e),
        }
    }

    /// Route one adapter output; returns true when the session is lost
    async fn handle_output(
        &self,
        ctx: &mut TurnContext,
        tracker: &mut SessionTracker,
        plan: &AttemptPlan,
        out: AdapterOutput,
    ) -> bool {
        let check_lost = plan.is_resume() && !ctx.detector.is_recorded();
        match out {
            AdapterOutput::Diagnostic(text) => {
                if check_lost && is_session_lost(&text, &ctx.markers) {
                    self.mark_lost(ctx, tracker, text).await;
                    return true;
                }
                false
            }
            AdapterOutput::Event(event) => {
                if check_lost {
                    let lost = event
                        .error_text()
                        .filter(|text| is_session_lost(text, &ctx.markers))
                        .map(str::to_string);
                    if let Some(text) = lost {
                        self.mark_lost(ctx, tracker, text).await;
                        return true;
                    }
                }
                self.accept_event(ctx, tracker, event).await;
                false
            }
        }
    }

    async fn mark_lost(
        &self,
        ctx: &mut TurnContext,
        tracker: &mut SessionTracker,
        message: String,
    ) {
        warn!(session = ?ctx.session_token, "Resumed session no longer exists: {}", message);
        let event = NormalizedEvent::new(
            EventKind::System,
            json!({ "subtype": "session_lost", "message": message }),
        );
        self.persist(ctx, tracker, event).await;
        tracker.mark_lost();
    }

    async fn accept_event(
        &self,
        ctx: &mut TurnContext,
        tracker: &mut SessionTracker,
        event: NormalizedEvent,
    ) {
        if event.kind == EventKind::Result && ctx.detector.is_recorded() {
            debug!("Dropping result event after the outcome was recorded");
            return;
        }
        let outcome = ctx.detector.observe(&event);
        self.persist(ctx, tracker, event).await;
        if let Some(outcome) = outcome {
            let synthesize = outcome.source != OutcomeSource::Explicit;
            self.apply_outcome(ctx, tracker, outcome, synthesize).await;
        }
    }

    /// Persist a freshly recorded outcome and start side effects for a success
    async fn apply_outcome(
        &self,
        ctx: &mut TurnContext,
        tracker: &mut SessionTracker,
        outcome: TurnOutcome,
        synthesize: bool,
    ) {
        if synthesize {
            self.persist(ctx, tracker, outcome.to_event()).await;
        }
        if outcome.triggers_side_effects() && ctx.side_effects.is_none() {
            let effects = self.side_effects.clone();
            let sandbox = Arc::clone(&ctx.sandbox);
            let effect_ctx = SideEffectContext {
                task_id: ctx.request.task_id.clone(),
                owner_id: ctx.request.owner_id.clone(),
                working_dir: ctx.request.working_dir.to_string_lossy().to_string(),
                description: Some(
                    ctx.request
                        .user_message
                        .chars()
                        .take(DESCRIPTION_MAX_CHARS)
                        .collect(),
                ),
            };
            ctx.side_effects = Some(tokio::spawn(
                async move { effects.run_after_success(sandbox.as_ref(), &effect_ctx).await }
                    .in_current_span(),
            ));
        }
    }

    async fn persist(
        &self,
        ctx: &mut TurnContext,
        tracker: &mut SessionTracker,
        event: NormalizedEvent,
    ) {
        for canonical in tracker.observe(event) {
            ctx.queue.enqueue(canonical);
        }
        if let Some(token) = tracker.take_unpersisted() {
            if let Err(e) = self.store.set_session(&ctx.request.task_id, &token).await {
                warn!(session = %token, "Failed to store session token: {}", e);
            }
            ctx.session_token = Some(token);
        }
    }

    fn flush(&self, ctx: &mut TurnContext, tracker: &mut SessionTracker) {
        for canonical in tracker.finish() {
            ctx.queue.enqueue(canonical);
        }
    }

    /// Forget the lost session and build the fresh-session retry
    async fn retry_plan(&self, ctx: &mut TurnContext) -> AttemptPlan {
        let task_id = ctx.request.task_id.clone();
        ctx.session_token = None;
        if let Err(e) = self.store.clear_session(&task_id).await {
            warn!("Failed to clear lost session token: {}", e);
        }
        let prior = match self.store.list_for_task(&task_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to load prior turns, retrying without history: {}", e);
                Vec::new()
            }
        };
        let history = render_history(&prior, &ctx.turn_id, &self.config.history);
        info!(
            prior_events = prior.len(),
            history_chars = history.as_ref().map(|h| h.chars().count()).unwrap_or(0),
            "Retrying with a fresh session"
        );
        let message = compose_retry_message(history.as_deref(), &ctx.request.user_message);
        AttemptPlan::fresh_retry(&ctx.request, message)
    }

    async fn abort(
        &self,
        mut ctx: TurnContext,
        mut tracker: SessionTracker,
        error: crate::Error,
    ) -> Result<TurnReport> {
        warn!("Turn setup failed: {}", error);
        let detail = format!("turn setup failed: {}", error);
        if let Some(outcome) = ctx.detector.on_setup_failed(detail) {
            self.persist(&mut ctx, &mut tracker, outcome.to_event()).await;
        }
        self.flush(&mut ctx, &mut tracker);
        let stats = ctx.queue.drain().await;
        debug!(?stats, "Append queue drained");
        Err(error)
    }

    async fn finish(&self, ctx: TurnContext, attempts: u32) -> Result<TurnReport> {
        let side_effect_runs = match ctx.side_effects {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("Side-effect task terminated abnormally: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let append_stats = ctx.queue.drain().await;
        let outcome = ctx.detector.into_outcome().unwrap_or_else(|| {
            TurnOutcome::error(OutcomeSource::FallbackExit, "no outcome recorded")
        });
        info!(
            status = %outcome.status,
            source = %outcome.source,
            written = append_stats.written,
            failed = append_stats.failed,
            side_effects = side_effect_runs.len(),
            "Turn finished"
        );
        Ok(TurnReport {
            task_id: ctx.request.task_id,
            turn_id: ctx.turn_id,
            outcome,
            session_token: ctx.session_token,
            attempts,
            append_stats,
            side_effect_runs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingReload, CountingSnapshot, ScriptedSandbox};
    use af_event_store::MemoryStore;

    #[tokio::test]
    async fn test_stop_without_running_turn() {
        let store = Arc::new(MemoryStore::new());
        let effects = SideEffects::new(
            Arc::new(CountingReload::new()),
            Arc::new(CountingSnapshot::new()),
            store.clone(),
        );
        let runner = TurnRunner::with_side_effects(store, PipelineConfig::default(), effects);
        let sandbox = ScriptedSandbox::new();
        assert!(!runner.stop(&sandbox, "task-1").await.unwrap());
        assert!(sandbox.killed().is_empty());
    }

    #[tokio::test]
    async fn test_stop_signals_recorded_pid() {
        let store = Arc::new(MemoryStore::new());
        store.set_running("task-1", 777).await.unwrap();
        let effects = SideEffects::new(
            Arc::new(CountingReload::new()),
            Arc::new(CountingSnapshot::new()),
            store.clone(),
        );
        let runner = TurnRunner::with_side_effects(store, PipelineConfig::default(), effects);
        let sandbox = ScriptedSandbox::new();
        assert!(runner.stop(&sandbox, "task-1").await.unwrap());
        assert_eq!(sandbox.killed(), vec![777]);
    }
}
