use std::fmt;

use thiserror::Error;

/// Phases of a single engine invocation.
///
/// Each `process` call flows through:
/// IDLE → DISCOVER → CLAIMED → TRANSFORMING → {SUCCEEDED | REJECTED | DEFERRED} → IDLE
///
/// DISCOVER may fall straight back to IDLE when there is nothing to claim or
/// the stop sentinel is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Discover,
    Claimed,
    Transforming,
    Succeeded,
    Rejected,
    Deferred,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "IDLE"),
            Phase::Discover => write!(f, "DISCOVER"),
            Phase::Claimed => write!(f, "CLAIMED"),
            Phase::Transforming => write!(f, "TRANSFORMING"),
            Phase::Succeeded => write!(f, "SUCCEEDED"),
            Phase::Rejected => write!(f, "REJECTED"),
            Phase::Deferred => write!(f, "DEFERRED"),
        }
    }
}

impl Phase {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::Discover)
                | (Phase::Discover, Phase::Claimed)
                | (Phase::Discover, Phase::Idle)
                | (Phase::Claimed, Phase::Transforming)
                | (
                    Phase::Transforming,
                    Phase::Succeeded | Phase::Rejected | Phase::Deferred
                )
                | (Phase::Succeeded | Phase::Rejected | Phase::Deferred, Phase::Idle)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal phase transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: Phase,
    pub to: Phase,
}

/// Tracks one invocation through its phases.
#[derive(Debug, Clone)]
pub struct StateMachine {
    phase: Phase,
    history: Vec<Phase>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves to `next`, recording the phase being left.
    pub fn advance(&mut self, next: Phase) -> Result<(), IllegalTransition> {
        if !self.phase.can_advance_to(next) {
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::trace!(from = %self.phase, to = %next, "phase");
        self.history.push(self.phase);
        self.phase = next;
        Ok(())
    }

    /// Every phase visited so far, including the current one.
    pub fn transitions(&self) -> Vec<Phase> {
        let mut all = self.history.clone();
        all.push(self.phase);
        all
    }
}
