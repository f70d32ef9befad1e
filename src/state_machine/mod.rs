mod job;
mod state;

pub use job::{DrainReport, FailureKind, ProcessSummary, StageOutcome};
pub use state::{IllegalTransition, Phase, StateMachine};
