use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::JoblineConfig;
use crate::error::{EngineError, StoreError};
use crate::lease::{FsLeaseBroker, FsSlotStore, LeaseStatus};
use crate::record::{PIPELINE_STAGE, RecordHandle, RecordStore};
use crate::retry::RetryPolicy;
use crate::topology::{Instance, Topology};

/// Everything a stage invocation needs, built once per process and passed
/// down explicitly.
pub struct PipelineContext {
    pub topology: Topology,
    pub retry: RetryPolicy,
    pub leases: FsLeaseBroker,
    pub store: RecordStore,
    pub stop_file: PathBuf,
    pub log_dir: PathBuf,
}

/// Record counts for one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirCount {
    pub name: String,
    pub waiting: usize,
    pub in_progress: usize,
}

#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub instance: Instance,
    pub flow: Vec<DirCount>,
    pub rejects: Vec<DirCount>,
}

/// Point-in-time view of the whole tree, for `status`.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub instances: Vec<InstanceStatus>,
    pub leases: Vec<LeaseStatus>,
    pub stop_requested: bool,
}

impl PipelineContext {
    /// `cancel` interrupts lease waits on shutdown.
    pub fn from_config(config: &JoblineConfig, cancel: CancellationToken) -> Result<Self> {
        let topology = config.topology().context("invalid stage topology")?;
        let lease_dir = config.lease_dir();
        let store = FsSlotStore::new(&lease_dir)
            .with_context(|| format!("cannot prepare lease directory {}", lease_dir.display()))?;
        let leases = FsLeaseBroker::new(
            store,
            config.endpoints.clone(),
            config.lease.wait_budget(),
            cancel,
        );

        Ok(Self {
            topology,
            retry: config.retry,
            leases,
            store: RecordStore::new(),
            stop_file: config.stop_file(),
            log_dir: config.log_dir(),
        })
    }

    /// Whether the global stop sentinel exists. Only ever read.
    pub fn stop_requested(&self) -> bool {
        self.stop_file.exists()
    }

    /// Creates a record in the first stage of the chosen instance.
    pub fn submit(
        &self,
        instance: Instance,
        mut headers: BTreeMap<String, String>,
        body: impl Into<String>,
    ) -> Result<RecordHandle, StoreError> {
        let first = self.topology.first_stage();
        headers.insert(PIPELINE_STAGE.to_string(), first.input.clone());
        let handle = self
            .store
            .create(&self.topology.input_dir(instance, first), headers, body)?;
        info!(job_id = %handle.id, %instance, stage = %first.name, "record submitted");
        Ok(handle)
    }

    /// Returns every in-progress claim of `stage_name` to its input, in both
    /// instances. Only safe when no worker is running that stage.
    pub fn recover(&self, stage_name: &str) -> Result<Vec<PathBuf>, EngineError> {
        let stage = self
            .topology
            .stage(stage_name)
            .ok_or_else(|| EngineError::UnknownStage(stage_name.to_string()))?;
        let mut restored = Vec::new();
        for instance in Instance::DRAIN_ORDER {
            let input = self.topology.input_dir(instance, stage);
            for claim in self.store.in_progress(&input)? {
                restored.push(self.store.recover(&claim)?);
            }
        }
        Ok(restored)
    }

    pub fn status(&self) -> Result<PipelineStatus> {
        let mut instances = Vec::new();
        for instance in Instance::DRAIN_ORDER {
            let base = self.topology.instance_root(instance);
            let flow = self
                .topology
                .flow_dirs()
                .into_iter()
                .map(|name| self.count(&base, name))
                .collect::<Result<Vec<_>, _>>()?;
            let rejects = self
                .topology
                .reject_dirs()
                .into_iter()
                .map(|name| self.count(&base, name))
                .collect::<Result<Vec<_>, _>>()?;
            instances.push(InstanceStatus {
                instance,
                flow,
                rejects,
            });
        }
        let leases = self
            .leases
            .store()
            .snapshot()
            .context("cannot read lease directory")?;

        Ok(PipelineStatus {
            instances,
            leases,
            stop_requested: self.stop_requested(),
        })
    }

    fn count(&self, base: &Path, name: &str) -> Result<DirCount, StoreError> {
        let dir = base.join(name);
        Ok(DirCount {
            name: name.to_string(),
            waiting: self.store.candidates(&dir)?.len(),
            in_progress: self.store.in_progress(&dir)?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::JOB_ID;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> PipelineContext {
        let config = JoblineConfig {
            root: dir.path().join("pipe"),
            ..JoblineConfig::default()
        };
        PipelineContext::from_config(&config, CancellationToken::new()).unwrap()
    }

    #[test]
    fn paths_follow_the_root() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        assert!(dir.path().join("pipe/locks").is_dir());
        assert_eq!(ctx.log_dir, dir.path().join("pipe/logs"));
        assert!(!ctx.stop_requested());

        std::fs::write(&ctx.stop_file, "").unwrap();
        assert!(ctx.stop_requested());
    }

    #[test]
    fn submit_lands_in_first_stage() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.topology.setup().unwrap();

        let handle = ctx
            .submit(Instance::Priority, BTreeMap::new(), "hello")
            .unwrap();

        assert_eq!(
            handle.path.parent().unwrap(),
            dir.path().join("pipe/priority/01_incoming")
        );
        let text = std::fs::read_to_string(&handle.path).unwrap();
        assert!(text.contains("Pipeline-Stage: 01_incoming\n"));
        assert!(text.contains(&format!("{JOB_ID}: {}\n", handle.id)));
    }

    #[test]
    fn status_counts_waiting_and_in_progress() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.topology.setup().unwrap();
        ctx.submit(Instance::Normal, BTreeMap::new(), "a").unwrap();
        ctx.submit(Instance::Normal, BTreeMap::new(), "b").unwrap();
        let input = ctx
            .topology
            .input_dir(Instance::Normal, ctx.topology.first_stage());
        let claimed = ctx.store.claim(&input).unwrap().unwrap();

        let status = ctx.status().unwrap();
        let normal = status
            .instances
            .iter()
            .find(|s| s.instance == Instance::Normal)
            .unwrap();
        assert_eq!(
            normal.flow[0],
            DirCount {
                name: "01_incoming".into(),
                waiting: 1,
                in_progress: 1,
            }
        );
        assert_eq!(normal.flow.len(), 7);
        assert_eq!(normal.rejects.len(), 6);
        assert!(status.leases.is_empty());
        drop(claimed);
    }

    #[test]
    fn recover_returns_abandoned_claims() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.topology.setup().unwrap();
        let handle = ctx.submit(Instance::Normal, BTreeMap::new(), "a").unwrap();
        let input = ctx
            .topology
            .input_dir(Instance::Normal, ctx.topology.first_stage());
        // A worker that died mid-transform leaves its claim behind.
        drop(ctx.store.claim(&input).unwrap().unwrap());
        assert!(!handle.path.exists());

        let restored = ctx.recover("incoming").unwrap();

        assert_eq!(restored, vec![handle.path.clone()]);
        assert!(handle.path.exists());
        assert!(ctx.store.in_progress(&input).unwrap().is_empty());
        assert!(matches!(
            ctx.recover("nope"),
            Err(EngineError::UnknownStage(_))
        ));
    }
}
