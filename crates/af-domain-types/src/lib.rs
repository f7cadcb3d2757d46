// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Domain types for the App Forge agent pipeline
//!
//! This crate contains the vocabulary shared by the event store, the agent
//! backends and the turn orchestrator: providers, canonical events, turn
//! requests and outcomes, and side-effect bookkeeping.
//!
//! These types must stay backend-agnostic. Only the protocol adapters in
//! `af-agents` know what a particular agent emits on the wire.

pub mod event;
pub mod outcome;
pub mod provider;
pub mod side_effect;
pub mod turn;

pub use event::*;
pub use outcome::*;
pub use provider::*;
pub use side_effect::*;
pub use turn::*;
