//! Session lifecycle phases.
//!
//! A session follows the orchestrator lifecycle:
//! IDLE → DEVICE_READY → GATES_READY → RUNNING → JOINED → TORN_DOWN
//!
//! Any failure before the split moves to ABORTED. Once the processes
//! have split, the session always proceeds through JOINED so that
//! teardown happens exactly once.

use crate::error::{StimMonError, StimMonResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Orchestrator lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    /// Nothing acquired yet.
    #[default]
    Idle,
    /// Device endpoints opened and configured.
    DeviceReady,
    /// Gate pair created, both gates closed.
    GatesReady,
    /// Processes split; roles executing.
    Running,
    /// Monitor process reaped.
    Joined,
    /// Gates and device handles released.
    TornDown,
    /// Setup failed before the split; acquired resources released.
    Aborted,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::DeviceReady => write!(f, "DEVICE_READY"),
            Self::GatesReady => write!(f, "GATES_READY"),
            Self::Running => write!(f, "RUNNING"),
            Self::Joined => write!(f, "JOINED"),
            Self::TornDown => write!(f, "TORN_DOWN"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl SessionPhase {
    /// Check if a transition to `target` is valid from the current phase.
    #[must_use]
    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        use SessionPhase::{Aborted, DeviceReady, GatesReady, Idle, Joined, Running, TornDown};

        matches!(
            (self, target),
            (Idle, DeviceReady)
                | (DeviceReady, GatesReady)
                | (GatesReady, Running)
                | (Running, Joined)
                | (Joined, TornDown)
                // Setup failures before the split
                | (Idle, Aborted)
                | (DeviceReady, Aborted)
                | (GatesReady, Aborted)
                // A finished session may be run again with fresh gates
                | (TornDown, Idle)
                | (Aborted, Idle)
        )
    }

    /// Returns true once the session has finished, successfully or not.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::TornDown | Self::Aborted)
    }
}

/// Phase tracker with transition validation.
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    current: SessionPhase,
}

impl PhaseTracker {
    /// Create a tracker starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.current
    }

    /// Move to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`StimMonError::InvalidPhaseTransition`] if the move is not allowed.
    pub fn transition(&mut self, target: SessionPhase) -> StimMonResult<()> {
        if !self.current.can_transition_to(target) {
            return Err(StimMonError::InvalidPhaseTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        tracing::debug!(from = %self.current, to = %target, "Session phase transition");
        self.current = target;
        Ok(())
    }
}
