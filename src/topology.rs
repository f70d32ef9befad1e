//! Static stage graph and the two directory trees it is laid out in.
//!
//! Both instances share one shape: `<root>/priority/<dir>` and
//! `<root>/normal/<dir>`. Priority is always drained first.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::TMP_DIR;

/// One of the two parallel copies of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instance {
    Priority,
    Normal,
}

impl Instance {
    /// Order in which a stage drains the instances.
    pub const DRAIN_ORDER: [Instance; 2] = [Instance::Priority, Instance::Normal];

    pub fn dir_name(self) -> &'static str {
        match self {
            Instance::Priority => "priority",
            Instance::Normal => "normal",
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A named step: one input directory, a success and a reject destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub input: String,
    pub output: String,
    pub reject: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology has no stages")]
    Empty,

    #[error("stage name {0:?} is declared twice")]
    DuplicateStage(String),

    #[error("directory {0:?} is the input of more than one stage")]
    SharedInput(String),

    #[error("directory name {name:?} is not allowed: {reason}")]
    InvalidDirectory { name: String, reason: &'static str },

    #[error("stage {stage:?} outputs to {output:?}, which is neither a later stage nor the holding area")]
    NotForward { stage: String, output: String },

    #[error("reject directory {reject:?} of stage {stage:?} collides with a stage or holding directory")]
    RejectCollision { stage: String, reject: String },
}

/// Validated stage graph rooted at a pipeline directory.
#[derive(Debug, Clone)]
pub struct Topology {
    root: PathBuf,
    holding: String,
    stages: Vec<StageSpec>,
}

impl Topology {
    /// Validates the stage list.
    ///
    /// Every edge must point forward: a stage's output is the input of a
    /// stage declared after it, or the final holding area. Reject directories
    /// are terminal and may be shared between stages.
    pub fn new(
        root: impl Into<PathBuf>,
        holding: impl Into<String>,
        stages: Vec<StageSpec>,
    ) -> Result<Self, TopologyError> {
        let holding = holding.into();
        if stages.is_empty() {
            return Err(TopologyError::Empty);
        }
        validate_dir_name(&holding)?;

        let mut names = HashSet::new();
        let mut inputs = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() || !names.insert(stage.name.as_str()) {
                return Err(TopologyError::DuplicateStage(stage.name.clone()));
            }
            for dir in [&stage.input, &stage.output, &stage.reject] {
                validate_dir_name(dir)?;
            }
            if !inputs.insert(stage.input.as_str()) || stage.input == holding {
                return Err(TopologyError::SharedInput(stage.input.clone()));
            }
        }

        for (index, stage) in stages.iter().enumerate() {
            let forward = stage.output == holding
                || stages[index + 1..].iter().any(|s| s.input == stage.output);
            if !forward {
                return Err(TopologyError::NotForward {
                    stage: stage.name.clone(),
                    output: stage.output.clone(),
                });
            }
            if inputs.contains(stage.reject.as_str()) || stage.reject == holding {
                return Err(TopologyError::RejectCollision {
                    stage: stage.name.clone(),
                    reject: stage.reject.clone(),
                });
            }
        }

        Ok(Self {
            root: root.into(),
            holding,
            stages,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn holding(&self) -> &str {
        &self.holding
    }

    /// Stages in declaration order, which is also pipeline order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn first_stage(&self) -> &StageSpec {
        &self.stages[0]
    }

    pub fn instance_root(&self, instance: Instance) -> PathBuf {
        self.root.join(instance.dir_name())
    }

    pub fn input_dir(&self, instance: Instance, stage: &StageSpec) -> PathBuf {
        self.instance_root(instance).join(&stage.input)
    }

    pub fn output_dir(&self, instance: Instance, stage: &StageSpec) -> PathBuf {
        self.instance_root(instance).join(&stage.output)
    }

    pub fn reject_dir(&self, instance: Instance, stage: &StageSpec) -> PathBuf {
        self.instance_root(instance).join(&stage.reject)
    }

    /// Directories that hold live records (stage inputs and the holding
    /// area), in pipeline order.
    pub fn flow_dirs(&self) -> Vec<&str> {
        let mut dirs: Vec<&str> = self.stages.iter().map(|s| s.input.as_str()).collect();
        dirs.push(&self.holding);
        dirs
    }

    /// Distinct reject directories, in first-use order.
    pub fn reject_dirs(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.stages
            .iter()
            .map(|s| s.reject.as_str())
            .filter(|dir| seen.insert(*dir))
            .collect()
    }

    /// Creates every stage directory (with its `tmp/`) and every reject
    /// directory for both instances.
    pub fn setup(&self) -> io::Result<()> {
        for instance in Instance::DRAIN_ORDER {
            let base = self.instance_root(instance);
            for dir in self.flow_dirs() {
                fs::create_dir_all(base.join(dir).join(TMP_DIR))?;
            }
            for dir in self.reject_dirs() {
                fs::create_dir_all(base.join(dir))?;
            }
        }
        Ok(())
    }
}

fn validate_dir_name(name: &str) -> Result<(), TopologyError> {
    let reason = if name.trim().is_empty() {
        "empty"
    } else if name.contains(['/', '\\']) {
        "contains a path separator"
    } else if name.starts_with('.') {
        "hidden or relative"
    } else if name == TMP_DIR {
        "reserved for temporary files"
    } else {
        return Ok(());
    };
    Err(TopologyError::InvalidDirectory {
        name: name.to_string(),
        reason,
    })
}
