//! File-backed staged job pipeline.
//!
//! Records move between stage directories by rename; shared inference
//! endpoints are guarded by filesystem leases. The `jobline` binary is a thin
//! CLI over [`context::PipelineContext`] and [`engine::StageEngine`].

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod lease;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod state_machine;
pub mod topology;
pub mod transform;
