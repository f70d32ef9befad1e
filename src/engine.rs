//! Moves one record through one stage per invocation.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::PipelineContext;
use crate::error::{EngineError, StoreError};
use crate::record::{
    self, ClaimedRecord, JOB_ID, JobRecord, PIPELINE_STAGE, REJECTION_REASON, STAGE_ATTEMPTS,
    STAGE_UPDATED,
};
use crate::retry::{Resolution, RetryOutcome};
use crate::state_machine::{
    DrainReport, FailureKind, Phase, ProcessSummary, StageOutcome, StateMachine,
};
use crate::topology::{Instance, StageSpec};
use crate::transform::{StageTransform, TransformContext, TransformRegistry};

pub struct StageEngine<'a> {
    ctx: &'a PipelineContext,
    transforms: &'a TransformRegistry,
    instances: &'a [Instance],
}

impl<'a> StageEngine<'a> {
    pub fn new(ctx: &'a PipelineContext, transforms: &'a TransformRegistry) -> Self {
        Self {
            ctx,
            transforms,
            instances: &Instance::DRAIN_ORDER,
        }
    }

    /// Restricts discovery to `instances`, scanned in the given order.
    pub fn with_instances(mut self, instances: &'a [Instance]) -> Self {
        self.instances = instances;
        self
    }

    /// Claims at most one record of `stage_name` and settles it.
    ///
    /// Instances are scanned in order (priority before normal by default),
    /// oldest record first. Only store I/O failures are errors; corrupt
    /// candidates are skipped and reported in the summary.
    pub async fn process(&self, stage_name: &str) -> Result<ProcessSummary, EngineError> {
        let stage = self
            .ctx
            .topology
            .stage(stage_name)
            .ok_or_else(|| EngineError::UnknownStage(stage_name.to_string()))?;
        let transform = self
            .transforms
            .get(stage_name)
            .ok_or_else(|| EngineError::MissingTransform(stage_name.to_string()))?;

        let mut machine = StateMachine::new();
        let mut summary = ProcessSummary::new(stage_name);

        machine.advance(Phase::Discover)?;
        let Some((instance, claimed)) = self.discover(stage, &mut summary)? else {
            machine.advance(Phase::Idle)?;
            summary.finish(&machine);
            return Ok(summary);
        };
        machine.advance(Phase::Claimed)?;

        let record_id = claimed.record_id();
        summary.claimed = true;
        summary.instance = Some(instance);
        summary.record_id = Some(record_id.clone());

        let span = info_span!("process", stage = %stage.name, %instance, job_id = %record_id);
        machine.advance(Phase::Transforming)?;
        let outcome = self
            .run_transform(stage, instance, &claimed, transform.as_ref())
            .instrument(span.clone())
            .await;
        summary.attempts = outcome.attempts;

        span.in_scope(|| {
            self.settle(stage, instance, claimed, outcome, &mut machine, &mut summary)
        })?;

        machine.advance(Phase::Idle)?;
        summary.finish(&machine);
        Ok(summary)
    }

    /// Calls [`process`](Self::process) until nothing is left to claim, the
    /// stop sentinel appears, or a record is deferred for lack of capacity.
    pub async fn drain(&self, stage_name: &str) -> Result<DrainReport, EngineError> {
        self.drain_with(stage_name, |_| {}).await
    }

    /// [`drain`](Self::drain), calling `on_progress` after every record.
    pub async fn drain_with<F>(
        &self,
        stage_name: &str,
        mut on_progress: F,
    ) -> Result<DrainReport, EngineError>
    where
        F: FnMut(&DrainReport),
    {
        let mut report = DrainReport::new(stage_name);
        loop {
            let summary = self.process(stage_name).await?;
            report.absorb(&summary);
            on_progress(&report);
            if !summary.claimed
                || summary.stopped
                || matches!(summary.outcome, StageOutcome::Deferred { .. })
            {
                break;
            }
        }
        debug!(
            stage = stage_name,
            succeeded = report.succeeded,
            rejected = report.rejected,
            deferred = report.deferred,
            "drain finished"
        );
        Ok(report)
    }

    fn discover(
        &self,
        stage: &StageSpec,
        summary: &mut ProcessSummary,
    ) -> Result<Option<(Instance, ClaimedRecord)>, EngineError> {
        for &instance in self.instances {
            let input = self.ctx.topology.input_dir(instance, stage);
            for candidate in self.ctx.store.candidates(&input)? {
                if self.ctx.stop_requested() {
                    info!(
                        stage = %stage.name,
                        stop_file = %self.ctx.stop_file.display(),
                        "stop sentinel present, not claiming"
                    );
                    summary.stopped = true;
                    return Ok(None);
                }
                match self.ctx.store.claim_path(&candidate) {
                    Ok(Some(claimed)) => return Ok(Some((instance, claimed))),
                    Ok(None) => continue,
                    Err(StoreError::Corrupt { path, reason }) => {
                        warn!(
                            stage = %stage.name,
                            path = %path.display(),
                            %reason,
                            "skipping corrupt record"
                        );
                        summary.corrupt.push(path);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(None)
    }

    async fn run_transform(
        &self,
        stage: &StageSpec,
        instance: Instance,
        claimed: &ClaimedRecord,
        transform: &dyn StageTransform,
    ) -> RetryOutcome {
        let leases = &self.ctx.leases;
        let record = &claimed.record;
        self.ctx
            .retry
            .run(|attempt| {
                let ctx = TransformContext {
                    stage,
                    instance,
                    attempt,
                    leases,
                };
                async move { transform.transform(record, &ctx).await }
            })
            .await
    }

    /// Persists the retry outcome: output directory, reject directory, or
    /// back to the input.
    fn settle(
        &self,
        stage: &StageSpec,
        instance: Instance,
        claimed: ClaimedRecord,
        outcome: RetryOutcome,
        machine: &mut StateMachine,
        summary: &mut ProcessSummary,
    ) -> Result<(), EngineError> {
        let attempts = outcome.attempts;
        let verdict = match outcome.resolution {
            Resolution::Accepted(record) => prepare_accepted(&claimed, record, stage, attempts),
            Resolution::Rejected(kind) => Err(kind),
            Resolution::Deferred(reason) => {
                machine.advance(Phase::Deferred)?;
                let origin = self.ctx.store.abandon(claimed)?;
                info!(%reason, "no endpoint capacity, record returned to input");
                summary.outcome = StageOutcome::Deferred { reason };
                summary.destination = Some(origin);
                return Ok(());
            }
        };

        match verdict {
            Ok(record) => {
                machine.advance(Phase::Succeeded)?;
                let output = self.ctx.topology.output_dir(instance, stage);
                let destination = self.ctx.store.transition(claimed, &record, &output)?;
                info!(attempts, "record advanced to {}", stage.output);
                summary.outcome = StageOutcome::Succeeded;
                summary.destination = Some(destination);
            }
            Err(kind) => {
                machine.advance(Phase::Rejected)?;
                let destination = self.reject(stage, instance, claimed, &kind, attempts)?;
                summary.outcome = StageOutcome::Rejected {
                    reason: sanitize(kind.reason()),
                };
                summary.destination = Some(destination);
            }
        }
        Ok(())
    }

    fn reject(
        &self,
        stage: &StageSpec,
        instance: Instance,
        claimed: ClaimedRecord,
        kind: &FailureKind,
        attempts: u32,
    ) -> Result<PathBuf, EngineError> {
        let reason = sanitize(kind.reason());
        let mut record = claimed.record.clone();
        record.set_header(REJECTION_REASON, reason.clone());
        stamp(&mut record, &stage.reject, attempts);

        let id = claimed.record_id();
        let reject_dir = self.ctx.topology.reject_dir(instance, stage);
        let destination = self.ctx.store.transition(claimed, &record, &reject_dir)?;
        warn!(attempts, %reason, "{kind}");
        self.append_ledger(instance, stage, &id, &reason);
        Ok(destination)
    }

    /// Appends `<id> <reason>` to `<log_dir>/<instance>_<reject>.log`.
    fn append_ledger(&self, instance: Instance, stage: &StageSpec, id: &str, reason: &str) {
        let path = self
            .ctx
            .log_dir
            .join(format!("{}_{}.log", instance.dir_name(), stage.reject));
        let written = fs::create_dir_all(&self.ctx.log_dir).and_then(|()| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{id} {reason}")
        });
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "failed to append rejection ledger");
        }
    }
}

/// Stamps an accepted record for the next stage. A record the transform left
/// unwritable becomes a rejection instead.
fn prepare_accepted(
    claimed: &ClaimedRecord,
    mut record: JobRecord,
    stage: &StageSpec,
    attempts: u32,
) -> Result<JobRecord, FailureKind> {
    if let Some(id) = claimed.record.id()
        && record.id() != Some(id)
    {
        warn!("transform changed {JOB_ID}, restoring it");
        record.set_header(JOB_ID, id);
    }
    record.headers.remove(REJECTION_REASON);
    stamp(&mut record, &stage.output, attempts);

    match record::render(&record) {
        Ok(_) => Ok(record),
        Err(e) => Err(FailureKind::Domain(format!(
            "transform produced an invalid record: {e}"
        ))),
    }
}

fn stamp(record: &mut JobRecord, stage_dir: &str, attempts: u32) {
    record.set_header(PIPELINE_STAGE, stage_dir);
    record.set_header(STAGE_ATTEMPTS, attempts.to_string());
    record.set_header(STAGE_UPDATED, Utc::now().to_rfc3339());
}

/// Rejection reasons live in a header value, so line breaks become spaces.
fn sanitize(reason: &str) -> String {
    reason.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoblineConfig;
    use crate::error::TransformError;
    use crate::transform::{Passthrough, Verdict};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Fails transiently `failures` times, then accepts with a marker header.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StageTransform for Flaky {
        async fn transform(
            &self,
            record: &JobRecord,
            _ctx: &TransformContext<'_>,
        ) -> Result<Verdict, TransformError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(TransformError::Transient(format!("backend down ({call})")));
            }
            let mut out = record.clone();
            out.set_header("Parsed", "yes");
            Ok(Verdict::Accept(out))
        }
    }

    struct Scripted(fn(&JobRecord) -> Result<Verdict, TransformError>);

    #[async_trait]
    impl StageTransform for Scripted {
        async fn transform(
            &self,
            record: &JobRecord,
            _ctx: &TransformContext<'_>,
        ) -> Result<Verdict, TransformError> {
            (self.0)(record)
        }
    }

    struct Fixture {
        _dir: TempDir,
        ctx: PipelineContext,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = JoblineConfig {
                root: dir.path().join("pipeline"),
                ..JoblineConfig::default()
            };
            let ctx = PipelineContext::from_config(&config, CancellationToken::new()).unwrap();
            ctx.topology.setup().unwrap();
            Self { _dir: dir, ctx }
        }

        fn dir(&self, instance: Instance, name: &str) -> PathBuf {
            self.ctx.topology.instance_root(instance).join(name)
        }

        fn submit(&self, instance: Instance, body: &str) -> PathBuf {
            let mut headers = BTreeMap::new();
            headers.insert("Title".to_string(), body.to_string());
            self.ctx
                .store
                .create(&self.dir(instance, "01_incoming"), headers, body)
                .unwrap()
                .path
        }

        fn registry(&self, transform: Arc<dyn StageTransform>) -> TransformRegistry {
            let mut registry = TransformRegistry::new();
            registry.register("incoming", transform);
            registry
        }
    }

    fn read(path: &Path) -> JobRecord {
        record::parse(&fs::read_to_string(path).unwrap()).unwrap()
    }

    fn files(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_file())
            .collect();
        found.sort();
        found
    }

    #[tokio::test]
    async fn success_moves_priority_record_first() {
        let fx = Fixture::new();
        let normal = fx.submit(Instance::Normal, "normal item");
        let priority = fx.submit(Instance::Priority, "urgent item");
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();

        assert_eq!(summary.outcome, StageOutcome::Succeeded);
        assert_eq!(summary.instance, Some(Instance::Priority));
        assert_eq!(summary.attempts, 1);
        assert!(!priority.exists());
        assert!(normal.exists());

        let moved = files(&fx.dir(Instance::Priority, "02_parsed"));
        assert_eq!(moved.len(), 1);
        assert_eq!(summary.destination.as_deref(), Some(moved[0].as_path()));
        let record = read(&moved[0]);
        assert_eq!(record.stage(), Some("02_parsed"));
        assert_eq!(record.header(STAGE_ATTEMPTS), Some("1"));
        assert!(record.header(STAGE_UPDATED).is_some());
        assert_eq!(record.body, "urgent item");
        assert_eq!(
            summary.phases,
            vec![
                Phase::Idle,
                Phase::Discover,
                Phase::Claimed,
                Phase::Transforming,
                Phase::Succeeded,
                Phase::Idle
            ]
        );
        assert!(files(&fx.dir(Instance::Priority, "01_incoming/tmp")).is_empty());
    }

    #[tokio::test]
    async fn transient_failures_below_budget_then_success() {
        let fx = Fixture::new();
        fx.submit(Instance::Normal, "item");
        let registry = fx.registry(Arc::new(Flaky::new(2)));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();

        assert_eq!(summary.outcome, StageOutcome::Succeeded);
        assert_eq!(summary.attempts, 3);
        let moved = files(&fx.dir(Instance::Normal, "02_parsed"));
        let record = read(&moved[0]);
        assert_eq!(record.header(STAGE_ATTEMPTS), Some("3"));
        assert_eq!(record.header("Parsed"), Some("yes"));
    }

    #[tokio::test]
    async fn exhausted_budget_rejects_and_writes_ledger() {
        let fx = Fixture::new();
        let original = fx.submit(Instance::Normal, "item");
        let id = read(&original).id().unwrap().to_string();
        let registry = fx.registry(Arc::new(Flaky::new(10)));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();

        let StageOutcome::Rejected { reason } = &summary.outcome else {
            panic!("expected rejection, got {:?}", summary.outcome);
        };
        assert!(reason.starts_with("transient failure after 3 attempts"));
        assert_eq!(summary.attempts, 3);

        let rejected = files(&fx.dir(Instance::Normal, "50_rejected_parse"));
        assert_eq!(rejected.len(), 1);
        let record = read(&rejected[0]);
        assert_eq!(record.stage(), Some("50_rejected_parse"));
        assert_eq!(record.rejection_reason(), Some(reason.as_str()));
        assert!(files(&fx.dir(Instance::Normal, "02_parsed")).is_empty());

        let ledger =
            fs::read_to_string(fx.ctx.log_dir.join("normal_50_rejected_parse.log")).unwrap();
        assert_eq!(ledger, format!("{id} {reason}\n"));
    }

    #[tokio::test]
    async fn domain_rejection_uses_one_attempt() {
        let fx = Fixture::new();
        fx.submit(Instance::Priority, "item");
        let registry = fx.registry(Arc::new(Scripted(|_| {
            Ok(Verdict::reject("duplicate of\nan earlier item"))
        })));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();

        assert_eq!(summary.attempts, 1);
        assert_eq!(
            summary.outcome,
            StageOutcome::Rejected {
                reason: "duplicate of an earlier item".into()
            }
        );
        let rejected = files(&fx.dir(Instance::Priority, "50_rejected_parse"));
        assert_eq!(
            read(&rejected[0]).rejection_reason(),
            Some("duplicate of an earlier item")
        );
        assert_eq!(read(&rejected[0]).header(STAGE_ATTEMPTS), Some("1"));
    }

    #[tokio::test]
    async fn resource_exhaustion_returns_record_untouched() {
        let fx = Fixture::new();
        let path = fx.submit(Instance::Normal, "item");
        let before = fs::read(&path).unwrap();
        let registry = fx.registry(Arc::new(Scripted(|_| {
            Err(TransformError::ResourceExhausted("all slots busy".into()))
        })));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();

        assert_eq!(
            summary.outcome,
            StageOutcome::Deferred {
                reason: "all slots busy".into()
            }
        );
        assert_eq!(summary.attempts, 0);
        assert_eq!(fs::read(&path).unwrap(), before);

        let report = engine.drain("incoming").await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.processed(), 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn corrupt_record_is_skipped_and_left_in_place() {
        let fx = Fixture::new();
        let corrupt = fx.dir(Instance::Priority, "01_incoming").join("broken.job");
        fs::write(&corrupt, "Title: no separator").unwrap();
        fx.submit(Instance::Normal, "fine");
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();

        assert_eq!(summary.corrupt, vec![corrupt.clone()]);
        assert_eq!(summary.instance, Some(Instance::Normal));
        assert_eq!(summary.outcome, StageOutcome::Succeeded);
        assert_eq!(fs::read_to_string(&corrupt).unwrap(), "Title: no separator");
    }

    #[tokio::test]
    async fn unwritable_header_is_treated_as_corrupt() {
        let fx = Fixture::new();
        let input = fx.dir(Instance::Normal, "01_incoming");
        let path = input.join("cr.job");
        fs::write(&path, "Job-ID: cr\nTitle: a\rb\n\nbody").unwrap();
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry);

        for _ in 0..2 {
            let summary = engine.process("incoming").await.unwrap();
            assert!(!summary.claimed);
            assert_eq!(summary.corrupt, vec![path.clone()]);
        }
        assert_eq!(
            fs::read(&path).unwrap(),
            b"Job-ID: cr\nTitle: a\rb\n\nbody".to_vec()
        );
        assert!(fx.ctx.store.in_progress(&input).unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_sentinel_prevents_claims() {
        let fx = Fixture::new();
        let path = fx.submit(Instance::Normal, "item");
        fs::write(&fx.ctx.stop_file, "").unwrap();
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();

        assert!(summary.stopped);
        assert!(!summary.claimed);
        assert_eq!(summary.outcome, StageOutcome::None);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn empty_stage_does_nothing() {
        let fx = Fixture::new();
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let summary = engine.process("incoming").await.unwrap();
        assert!(!summary.claimed);
        assert_eq!(summary.phases, vec![Phase::Idle, Phase::Discover, Phase::Idle]);
    }

    #[tokio::test]
    async fn unknown_stage_and_missing_transform_are_errors() {
        let fx = Fixture::new();
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry);

        assert!(matches!(
            engine.process("nope").await,
            Err(EngineError::UnknownStage(_))
        ));
        assert!(matches!(
            engine.process("parsed").await,
            Err(EngineError::MissingTransform(_))
        ));
    }

    #[tokio::test]
    async fn job_id_survives_transform_and_bad_headers_reject() {
        let fx = Fixture::new();
        let path = fx.submit(Instance::Normal, "item");
        let id = read(&path).id().unwrap().to_string();
        let registry = fx.registry(Arc::new(Scripted(|record| {
            let mut out = record.clone();
            out.set_header(JOB_ID, "hijacked");
            Ok(Verdict::Accept(out))
        })));
        let engine = StageEngine::new(&fx.ctx, &registry);
        engine.process("incoming").await.unwrap();
        let moved = files(&fx.dir(Instance::Normal, "02_parsed"));
        assert_eq!(read(&moved[0]).id(), Some(id.as_str()));

        fx.submit(Instance::Normal, "second");
        let registry = fx.registry(Arc::new(Scripted(|record| {
            let mut out = record.clone();
            out.set_header("Summary", "two\nlines");
            Ok(Verdict::Accept(out))
        })));
        let engine = StageEngine::new(&fx.ctx, &registry);
        let summary = engine.process("incoming").await.unwrap();
        let StageOutcome::Rejected { reason } = summary.outcome else {
            panic!("expected rejection");
        };
        assert!(reason.starts_with("transform produced an invalid record"));
        let rejected = files(&fx.dir(Instance::Normal, "50_rejected_parse"));
        assert_eq!(read(&rejected[0]).header("Summary"), None);
    }

    #[tokio::test]
    async fn instance_filter_leaves_other_tree_untouched() {
        let fx = Fixture::new();
        let urgent = fx.submit(Instance::Priority, "urgent");
        let urgent_bytes = fs::read(&urgent).unwrap();
        fx.submit(Instance::Normal, "n0");
        fx.submit(Instance::Normal, "n1");
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry).with_instances(&[Instance::Normal]);

        let report = engine.drain("incoming").await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(files(&fx.dir(Instance::Normal, "02_parsed")).len(), 2);
        assert_eq!(fs::read(&urgent).unwrap(), urgent_bytes);
        assert!(files(&fx.dir(Instance::Priority, "02_parsed")).is_empty());
    }

    #[tokio::test]
    async fn drain_empties_the_stage() {
        let fx = Fixture::new();
        for i in 0..3 {
            fx.submit(Instance::Normal, &format!("n{i}"));
        }
        fx.submit(Instance::Priority, "p");
        let registry = fx.registry(Arc::new(Passthrough));
        let engine = StageEngine::new(&fx.ctx, &registry);

        let report = engine.drain("incoming").await.unwrap();

        assert_eq!(report.succeeded, 4);
        assert!(files(&fx.dir(Instance::Normal, "01_incoming")).is_empty());
        assert_eq!(files(&fx.dir(Instance::Normal, "02_parsed")).len(), 3);
        assert_eq!(files(&fx.dir(Instance::Priority, "02_parsed")).len(), 1);
    }
}
