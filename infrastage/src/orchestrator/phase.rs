//! Orchestration phases.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{InfrastageError, Result};

/// Where an orchestration run currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    /// Nothing has happened yet.
    #[default]
    NotStarted,
    /// The network exists (created or reused).
    NetworkReady,
    /// Variants are being provisioned.
    VariantPending {
        /// Variants finished so far.
        completed: usize,
        /// Total variants.
        total: usize,
    },
    /// Every variant finished.
    VariantsComplete,
    /// Teardown ran.
    TornDown,
}

impl RunPhase {
    /// Returns true if moving to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use RunPhase::{NetworkReady, NotStarted, TornDown, VariantPending, VariantsComplete};

        match (self, next) {
            (_, TornDown) => true,
            (NotStarted, NetworkReady) => true,
            (NetworkReady, VariantPending { completed: 0, .. }) => true,
            (NetworkReady, VariantsComplete) => true,
            (
                VariantPending { completed, total },
                VariantPending {
                    completed: next_completed,
                    total: next_total,
                },
            ) => total == next_total && next_completed > completed && next_completed <= total,
            (VariantPending { .. }, VariantsComplete) => true,
            _ => false,
        }
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: Self) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(InfrastageError::Phase {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not_started"),
            Self::NetworkReady => f.write_str("network_ready"),
            Self::VariantPending { completed, total } => {
                write!(f, "variant_pending({completed}/{total})")
            }
            Self::VariantsComplete => f.write_str("variants_complete"),
            Self::TornDown => f.write_str("torn_down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let mut phase = RunPhase::default();
        phase.transition(RunPhase::NetworkReady).unwrap();
        phase.transition(RunPhase::VariantPending { completed: 0, total: 2 }).unwrap();
        phase.transition(RunPhase::VariantPending { completed: 1, total: 2 }).unwrap();
        phase.transition(RunPhase::VariantPending { completed: 2, total: 2 }).unwrap();
        phase.transition(RunPhase::VariantsComplete).unwrap();
        phase.transition(RunPhase::TornDown).unwrap();
        assert_eq!(phase, RunPhase::TornDown);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut phase = RunPhase::NotStarted;
        let err = phase.transition(RunPhase::VariantsComplete).unwrap_err();
        assert_eq!(err.to_string(), "Illegal phase transition: not_started -> variants_complete");
        assert_eq!(phase, RunPhase::NotStarted);

        let pending = RunPhase::VariantPending { completed: 1, total: 2 };
        assert!(!pending.can_transition_to(&RunPhase::VariantPending { completed: 1, total: 2 }));
        assert!(!RunPhase::TornDown.can_transition_to(&RunPhase::NetworkReady));
    }

    #[test]
    fn test_teardown_allowed_from_anywhere() {
        for phase in [
            RunPhase::NotStarted,
            RunPhase::NetworkReady,
            RunPhase::VariantPending { completed: 0, total: 1 },
            RunPhase::VariantsComplete,
            RunPhase::TornDown,
        ] {
            assert!(phase.can_transition_to(&RunPhase::TornDown), "{phase}");
        }
    }
}
