//! Core domain model types for infrastage.
//!
//! This module contains the fundamental types shared by the runner, the
//! state store and the orchestrator:
//! - Cloud provider identifiers
//! - Stage status categories used in logs and reports
//! - Stage lifecycle events

mod event;
mod provider;
mod status;

pub use event::StageEvent;
pub use provider::Provider;
pub use status::StageStatus;
