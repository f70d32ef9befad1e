mod format;
mod store;

use std::collections::BTreeMap;

pub use format::{FormatError, decode, parse, render};
pub use store::{ClaimedRecord, RecordHandle, RecordStore, TMP_DIR};

/// Immutable identifier assigned when a record is first created.
pub const JOB_ID: &str = "Job-ID";
/// Directory name of the stage the record currently sits in.
pub const PIPELINE_STAGE: &str = "Pipeline-Stage";
pub const REJECTION_REASON: &str = "Rejection-Reason";
/// Transform attempts spent by the last stage that handled the record.
pub const STAGE_ATTEMPTS: &str = "Stage-Attempts";
pub const STAGE_UPDATED: &str = "Stage-Updated";

/// A job record: string headers plus an opaque text body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRecord {
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl JobRecord {
    pub fn new(headers: BTreeMap<String, String>, body: impl Into<String>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn id(&self) -> Option<&str> {
        self.header(JOB_ID).filter(|id| !id.is_empty())
    }

    pub fn stage(&self) -> Option<&str> {
        self.header(PIPELINE_STAGE)
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.header(REJECTION_REASON)
    }
}
