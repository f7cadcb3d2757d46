// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent turn orchestration for App Forge
//!
//! A turn launches a detached agent process in a sandbox, normalizes its
//! output into canonical events, persists them in order, decides the single
//! terminal outcome and runs the post-turn side effects once.

pub mod completion;
pub mod config;
pub mod continuity;
pub mod controller;
pub mod error;
pub mod object_store;
pub mod sandbox;
pub mod side_effects;
pub mod turn;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use completion::CompletionDetector;
pub use config::PipelineConfig;
pub use continuity::{SessionState, SessionTracker};
pub use controller::{stop_process, AgentController, AgentHandle, AttemptPlan};
pub use error::Error;
pub use object_store::{FsObjectStore, HttpObjectStore, ObjectStore};
pub use sandbox::{CommandOutput, LocalSandbox, OutputChunk, Sandbox, SandboxCommand};
pub use side_effects::{
    ArchiveSnapshotter, BundleExporter, BundleRequest, HttpReloadTrigger, NoopReloadTrigger,
    ReloadTrigger, SandboxBundleExporter, SideEffectContext, SideEffects, SnapshotReceipt,
    SnapshotRequest, SnapshotTrigger, TriggerResult,
};
pub use turn::{TurnReport, TurnRunner};

/// Result type for orchestration
pub type Result<T> = std::result::Result<T, Error>;
