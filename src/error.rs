use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::record::FormatError;
use crate::state_machine::IllegalTransition;

/// Failures of the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The header block could not be parsed. The file has been put back
    /// where it was found.
    #[error("corrupt record {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("record {} already exists", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("record cannot be written: {0}")]
    InvalidHeader(#[from] FormatError),
}

impl StoreError {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Failures of the lease broker.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Every eligible endpoint slot stayed busy for the whole wait budget.
    #[error("no endpoint slot available for {purpose:?} after {attempts} attempts")]
    ResourceExhausted { purpose: String, attempts: u32 },

    #[error("lease acquisition cancelled by shutdown")]
    Cancelled,

    #[error("lease I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LeaseError {
    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Errors a stage transform may return instead of a verdict.
///
/// Explicit domain rejections are not errors: they are returned as
/// [`Verdict::Reject`](crate::transform::Verdict::Reject).
#[derive(Debug, Error)]
pub enum TransformError {
    /// Operational failure expected to sometimes succeed on retry. Failures of
    /// a transform's own collaborators land here too.
    #[error("{0}")]
    Transient(String),

    /// No endpoint capacity right now. The record is handed back untouched
    /// and the attempt is not counted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl From<LeaseError> for TransformError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::ResourceExhausted { .. } | LeaseError::Cancelled => {
                Self::ResourceExhausted(err.to_string())
            }
            LeaseError::Io { .. } => Self::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("no transform registered for stage {0}")]
    MissingTransform(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Phase(#[from] IllegalTransition),
}
