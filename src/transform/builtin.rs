use async_trait::async_trait;

use super::{StageTransform, TransformContext, Verdict};
use crate::error::TransformError;
use crate::record::JobRecord;

/// Forwards every record unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl StageTransform for Passthrough {
    async fn transform(
        &self,
        record: &JobRecord,
        _ctx: &TransformContext<'_>,
    ) -> Result<Verdict, TransformError> {
        Ok(Verdict::Accept(record.clone()))
    }
}

/// Rejects records missing any of the listed headers, or carrying them empty.
#[derive(Debug, Clone, Default)]
pub struct RequireHeaders {
    headers: Vec<String>,
}

impl RequireHeaders {
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl StageTransform for RequireHeaders {
    async fn transform(
        &self,
        record: &JobRecord,
        _ctx: &TransformContext<'_>,
    ) -> Result<Verdict, TransformError> {
        let missing: Vec<&str> = self
            .headers
            .iter()
            .filter(|h| record.header(h).is_none_or(|v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(Verdict::Accept(record.clone()))
        } else {
            Ok(Verdict::reject(format!(
                "missing required headers: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{FsLeaseBroker, FsSlotStore, WaitBudget};
    use crate::topology::{Instance, StageSpec};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn fixture(dir: &TempDir) -> (StageSpec, FsLeaseBroker) {
        let stage = StageSpec {
            name: "parsed".into(),
            input: "02_parsed".into(),
            output: "03_deduped".into(),
            reject: "51_rejected_duplicate".into(),
        };
        let broker = FsLeaseBroker::new(
            FsSlotStore::new(dir.path()).unwrap(),
            Vec::new(),
            WaitBudget {
                max_attempts: 1,
                base_delay: Duration::ZERO,
                jitter_max: Duration::ZERO,
            },
            CancellationToken::new(),
        );
        (stage, broker)
    }

    fn record(headers: &[(&str, &str)]) -> JobRecord {
        let mut record = JobRecord::new(Default::default(), "body");
        for (k, v) in headers {
            record.set_header(*k, *v);
        }
        record
    }

    #[tokio::test]
    async fn passthrough_returns_the_same_record() {
        let dir = TempDir::new().unwrap();
        let (stage, leases) = fixture(&dir);
        let ctx = TransformContext {
            stage: &stage,
            instance: Instance::Normal,
            attempt: 1,
            leases: &leases,
        };
        let input = record(&[("Title", "x")]);

        let verdict = Passthrough.transform(&input, &ctx).await.unwrap();
        assert_eq!(verdict, Verdict::Accept(input));
    }

    #[tokio::test]
    async fn require_headers_names_every_missing_header() {
        let dir = TempDir::new().unwrap();
        let (stage, leases) = fixture(&dir);
        let ctx = TransformContext {
            stage: &stage,
            instance: Instance::Priority,
            attempt: 1,
            leases: &leases,
        };
        let check = RequireHeaders::new(vec!["Title".into(), "Source".into(), "Lang".into()]);

        let verdict = check
            .transform(&record(&[("Title", "x"), ("Lang", "  ")]), &ctx)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::reject("missing required headers: Source, Lang"));

        let complete = record(&[("Title", "x"), ("Source", "s"), ("Lang", "en")]);
        let verdict = check.transform(&complete, &ctx).await.unwrap();
        assert_eq!(verdict, Verdict::Accept(complete));
    }
}
