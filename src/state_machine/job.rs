use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::state::{Phase, StateMachine};
use crate::topology::Instance;

/// Why a record was rejected.
/// Only domain rejections are final on the first attempt; transient failures
/// become rejections once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The stage's own logic said no (content failed a check).
    Domain(String),
    /// Operational failures exhausted every attempt.
    Transient(String),
}

impl FailureKind {
    /// Reason recorded in the `Rejection-Reason` header.
    pub fn reason(&self) -> &str {
        match self {
            FailureKind::Domain(reason) | FailureKind::Transient(reason) => reason,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Domain(msg) => write!(f, "Domain rejection: {msg}"),
            FailureKind::Transient(msg) => write!(f, "Transient failure: {msg}"),
        }
    }
}

/// What happened to the record claimed by one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Nothing was claimed.
    None,
    Succeeded,
    Rejected { reason: String },
    /// No endpoint capacity; the record went back to its input directory.
    Deferred { reason: String },
}

/// Result of one `StageEngine::process` call.
#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub stage: String,
    pub claimed: bool,
    pub outcome: StageOutcome,
    pub record_id: Option<String>,
    pub instance: Option<Instance>,
    pub attempts: u32,
    pub destination: Option<PathBuf>,
    /// Candidates skipped because their header block is malformed.
    pub corrupt: Vec<PathBuf>,
    /// The stop sentinel was seen before a claim.
    pub stopped: bool,
    pub phases: Vec<Phase>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl ProcessSummary {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            claimed: false,
            outcome: StageOutcome::None,
            record_id: None,
            instance: None,
            attempts: 0,
            destination: None,
            corrupt: Vec::new(),
            stopped: false,
            phases: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Stamps the phase history and elapsed time.
    pub fn finish(&mut self, machine: &StateMachine) {
        self.phases = machine.transitions();
        self.duration_ms = (Utc::now() - self.started_at).num_milliseconds();
    }
}

/// Totals over repeated `process` calls for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub stage: String,
    pub succeeded: u32,
    pub rejected: u32,
    pub deferred: u32,
    pub corrupt: BTreeSet<PathBuf>,
    pub stopped: bool,
}

impl DrainReport {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    pub fn absorb(&mut self, summary: &ProcessSummary) {
        match summary.outcome {
            StageOutcome::None => {}
            StageOutcome::Succeeded => self.succeeded += 1,
            StageOutcome::Rejected { .. } => self.rejected += 1,
            StageOutcome::Deferred { .. } => self.deferred += 1,
        }
        self.corrupt.extend(summary.corrupt.iter().cloned());
        self.stopped |= summary.stopped;
    }

    pub fn processed(&self) -> u32 {
        self.succeeded + self.rejected
    }
}
