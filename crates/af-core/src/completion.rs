// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Terminal outcome detection
//!
//! Backends do not agree on how a turn ends. Some emit a result message,
//! some only stop talking, some crash right after their last useful message.
//! The detector folds every signal of one turn into exactly one
//! [`TurnOutcome`].

use af_domain_types::{NormalizedEvent, OutcomeSource, TurnOutcome};
use tracing::{debug, info};

#[derive(Debug)]
pub struct CompletionDetector {
    stop_reasons: Vec<String>,
    recorded: Option<TurnOutcome>,
    cancel_armed: bool,
}

impl CompletionDetector {
    pub fn new(stop_reasons: Vec<String>) -> Self {
        Self {
            stop_reasons,
            recorded: None,
            cancel_armed: false,
        }
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded.is_some()
    }

    pub fn into_outcome(self) -> Option<TurnOutcome> {
        self.recorded
    }

    /// Record `outcome` unless one already exists
    fn record(&mut self, outcome: TurnOutcome) -> Option<TurnOutcome> {
        if let Some(existing) = &self.recorded {
            debug!(
                kept = %existing.source,
                ignored = %outcome.source,
                "Outcome already recorded"
            );
            return None;
        }
        info!(status = %outcome.status, source = %outcome.source, "Turn outcome recorded");
        self.recorded = Some(outcome.clone());
        Some(outcome)
    }

    /// Inspect one normalized event
    ///
    /// Returns the outcome when this event decided it. An explicit result
    /// is already a `result` event; an inferred one needs a synthesized event.
    pub fn observe(&mut self, event: &NormalizedEvent) -> Option<TurnOutcome> {
        if let Some(outcome) = TurnOutcome::from_explicit(event) {
            return self.record(outcome);
        }
        let reason = event.stop_reason()?;
        if self.stop_reasons.iter().any(|r| r == reason) {
            return self.record(
                TurnOutcome::success(OutcomeSource::InferredFromStopReason).with_detail(reason),
            );
        }
        None
    }

    /// The process exited
    pub fn on_process_exit(&mut self, exit_code: Option<i32>) -> Option<TurnOutcome> {
        if self.cancel_armed {
            return self.record(TurnOutcome::success(OutcomeSource::Cancelled));
        }
        match exit_code {
            Some(0) => self.record(TurnOutcome::success(OutcomeSource::FallbackExit)),
            Some(code) => self.record(TurnOutcome::error(
                OutcomeSource::FallbackExit,
                format!("agent exited with code {}", code),
            )),
            None => self.record(TurnOutcome::error(
                OutcomeSource::FallbackExit,
                "agent exited without an exit code",
            )),
        }
    }

    /// No output arrived before the watchdog fired
    pub fn on_watchdog(&mut self, waited_secs: u64) -> Option<TurnOutcome> {
        self.record(TurnOutcome::error(
            OutcomeSource::FallbackTimeout,
            format!("no output within {}s", waited_secs),
        ))
    }

    /// The sandbox or the backend failed before any process ran
    pub fn on_setup_failed(&mut self, detail: impl Into<String>) -> Option<TurnOutcome> {
        self.record(TurnOutcome::error(OutcomeSource::FallbackExit, detail))
    }

    /// The retry after a lost session could not complete
    pub fn on_retry_failed(&mut self, detail: impl Into<String>) -> Option<TurnOutcome> {
        self.record(TurnOutcome::error(OutcomeSource::FallbackRetry, detail))
    }

    /// Stop was requested; a later exit is not a failure
    pub fn arm_cancel(&mut self) {
        self.cancel_armed = true;
    }

    pub fn is_cancel_armed(&self) -> bool {
        self.cancel_armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain_types::OutcomeStatus;

    fn detector() -> CompletionDetector {
        CompletionDetector::new(vec!["end_turn".into(), "max_tokens".into()])
    }

    #[test]
    fn test_explicit_result_wins() {
        let mut d = detector();
        let event =
            NormalizedEvent::explicit_result(OutcomeStatus::Error, None, Some("boom".into()));
        let outcome = d.observe(&event).unwrap();
        assert_eq!(outcome.source, OutcomeSource::Explicit);
        assert_eq!(outcome.detail.as_deref(), Some("boom"));
        assert!(d.on_process_exit(Some(0)).is_none());
    }

    #[test]
    fn test_stop_reason_allow_list() {
        let mut d = detector();
        assert!(d.observe(&NormalizedEvent::assistant_text("...", Some("tool_use"))).is_none());
        let outcome = d
            .observe(&NormalizedEvent::assistant_text("done", Some("end_turn")))
            .unwrap();
        assert_eq!(outcome.source, OutcomeSource::InferredFromStopReason);
        assert!(outcome.is_success());

        // A late explicit result does not produce a second outcome.
        let late = NormalizedEvent::explicit_result(OutcomeStatus::Success, None, None);
        assert!(d.observe(&late).is_none());
    }

    #[test]
    fn test_exit_fallbacks() {
        let mut d = detector();
        let outcome = d.on_process_exit(Some(2)).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.source, OutcomeSource::FallbackExit);

        let mut d = detector();
        assert!(d.on_process_exit(Some(0)).unwrap().is_success());
    }

    #[test]
    fn test_watchdog_then_exit_keeps_timeout() {
        let mut d = detector();
        assert_eq!(d.on_watchdog(30).unwrap().source, OutcomeSource::FallbackTimeout);
        assert!(d.on_process_exit(Some(143)).is_none());
        assert_eq!(d.into_outcome().unwrap().source, OutcomeSource::FallbackTimeout);
    }

    #[test]
    fn test_setup_failure_is_an_error_outcome() {
        let mut d = detector();
        let outcome = d.on_setup_failed("turn setup failed: sandbox unreachable").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(!outcome.triggers_side_effects());
        assert!(d.on_process_exit(Some(0)).is_none());
    }

    #[test]
    fn test_cancel_armed_exit_is_cancelled_success() {
        let mut d = detector();
        d.arm_cancel();
        let outcome = d.on_process_exit(Some(143)).unwrap();
        assert_eq!(outcome.source, OutcomeSource::Cancelled);
        assert!(outcome.is_success());
        assert!(!outcome.triggers_side_effects());
    }
}
