//! The per-stage work seam.
//!
//! A stage is a value implementing [`StageTransform`], registered by stage
//! name in a [`TransformRegistry`]. The engine never knows what a stage does;
//! it only interprets the verdict.

mod builtin;
mod command;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::JoblineConfig;
use crate::error::TransformError;
use crate::lease::FsLeaseBroker;
use crate::record::JobRecord;
use crate::topology::{Instance, StageSpec};

pub use builtin::{Passthrough, RequireHeaders};
pub use command::CommandTransform;

/// What a transform decided about a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the (possibly rewritten) record.
    Accept(JobRecord),
    /// Terminal domain rejection; never retried.
    Reject { reason: String },
}

impl Verdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Verdict::Reject {
            reason: reason.into(),
        }
    }
}

/// Everything a transform may look at besides the record itself.
pub struct TransformContext<'a> {
    pub stage: &'a StageSpec,
    pub instance: Instance,
    /// 1-based attempt number within the current retry loop.
    pub attempt: u32,
    pub leases: &'a FsLeaseBroker,
}

#[async_trait]
pub trait StageTransform: Send + Sync {
    /// Transient problems are `Err(TransformError::Transient)`; a lack of
    /// endpoint capacity is `Err(TransformError::ResourceExhausted)`.
    async fn transform(
        &self,
        record: &JobRecord,
        ctx: &TransformContext<'_>,
    ) -> Result<Verdict, TransformError>;
}

/// Transform selection as written in `jobline.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    #[default]
    Passthrough,
    RequireHeaders {
        headers: Vec<String>,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Lease an endpoint advertising this capability before running.
        #[serde(default)]
        capability: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_timeout_secs() -> u64 {
    300
}

impl TransformSpec {
    pub fn build(&self) -> Arc<dyn StageTransform> {
        match self {
            TransformSpec::Passthrough => Arc::new(Passthrough),
            TransformSpec::RequireHeaders { headers } => {
                Arc::new(RequireHeaders::new(headers.clone()))
            }
            TransformSpec::Command {
                program,
                args,
                capability,
                timeout_secs,
            } => Arc::new(CommandTransform {
                program: program.clone(),
                args: args.clone(),
                capability: capability.clone(),
                timeout: std::time::Duration::from_secs(*timeout_secs),
            }),
        }
    }
}

/// Stage name → transform.
#[derive(Default, Clone)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn StageTransform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: impl Into<String>, transform: Arc<dyn StageTransform>) {
        self.transforms.insert(stage.into(), transform);
    }

    pub fn get(&self, stage: &str) -> Option<Arc<dyn StageTransform>> {
        self.transforms.get(stage).cloned()
    }

    pub fn from_config(config: &JoblineConfig) -> Self {
        let mut registry = Self::new();
        for stage in &config.stages {
            registry.register(stage.name.clone(), stage.transform.build());
        }
        registry
    }
}
