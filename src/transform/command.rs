//! External program as a stage.
//!
//! The record body goes to the program's stdin. Exit status decides the
//! verdict: 0 accepts, 2 rejects, anything else is a transient failure. On
//! acceptance stdout may carry `Key: Value` lines merged into the headers,
//! optionally followed by a blank line and a replacement body.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{StageTransform, TransformContext, Verdict};
use crate::error::TransformError;
use crate::lease::FsLeaseHandle;
use crate::record::{self, FormatError, JobRecord};

/// Exit status a program uses to reject the record on its merits.
pub const REJECT_EXIT_CODE: i32 = 2;

const MAX_REASON_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandTransform {
    pub program: String,
    pub args: Vec<String>,
    pub capability: Option<String>,
    pub timeout: Duration,
}

#[async_trait]
impl StageTransform for CommandTransform {
    async fn transform(
        &self,
        record: &JobRecord,
        ctx: &TransformContext<'_>,
    ) -> Result<Verdict, TransformError> {
        let lease = match &self.capability {
            Some(capability) => {
                let purpose = format!(
                    "{}:{}",
                    ctx.stage.name,
                    record.id().unwrap_or("unknown")
                );
                let budget = ctx.leases.budget();
                Some(
                    ctx.leases
                        .acquire(|e| e.supports(capability), &purpose, budget)
                        .await?,
                )
            }
            None => None,
        };

        let result = self.execute(record, ctx, lease.as_ref()).await;

        if let Some(lease) = lease
            && let Err(e) = lease.release()
        {
            warn!(error = %e, "failed to release endpoint lease");
        }
        result
    }
}

impl CommandTransform {
    async fn execute(
        &self,
        record: &JobRecord,
        ctx: &TransformContext<'_>,
        lease: Option<&FsLeaseHandle>,
    ) -> Result<Verdict, TransformError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("JOBLINE_STAGE", &ctx.stage.name)
            .env("JOBLINE_INSTANCE", ctx.instance.dir_name())
            .env("JOBLINE_JOB_ID", record.id().unwrap_or_default())
            .env("JOBLINE_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(lease) = lease {
            command
                .env("JOBLINE_ENDPOINT_ID", &lease.endpoint().id)
                .env("JOBLINE_ENDPOINT_URL", &lease.endpoint().url);
        }

        let mut child = command.spawn().map_err(|e| {
            TransformError::Transient(format!("failed to start {}: {e}", self.program))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = record.body.clone().into_bytes();
            // The program may exit without reading its input.
            tokio::spawn(async move {
                let _ = stdin.write_all(&body).await;
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(TransformError::Transient(format!(
                    "{} failed while running: {e}",
                    self.program
                )));
            }
            Err(_) => {
                return Err(TransformError::Transient(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs_f64()
                )));
            }
        };

        let stdout = record::decode(output.stdout);
        let stderr = record::decode(output.stderr);
        debug!(
            program = %self.program,
            status = ?output.status.code(),
            stdout_len = stdout.len(),
            "command finished"
        );

        match output.status.code() {
            Some(0) => apply_output(record, &stdout)
                .map(Verdict::Accept)
                .map_err(|e| {
                    TransformError::Transient(format!(
                        "{} printed malformed headers: {e}",
                        self.program
                    ))
                }),
            Some(REJECT_EXIT_CODE) => {
                let reason = first_non_empty(&[&stderr, &stdout])
                    .unwrap_or_else(|| format!("rejected by {}", self.program));
                Ok(Verdict::reject(reason))
            }
            _ => Err(TransformError::Transient(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                first_non_empty(&[&stderr]).unwrap_or_default()
            ))),
        }
    }
}

/// Merges stdout headers into a copy of `record`. A blank line followed by
/// text replaces the body; headers alone leave it untouched.
fn apply_output(record: &JobRecord, stdout: &str) -> Result<JobRecord, FormatError> {
    let mut result = record.clone();
    if stdout.trim().is_empty() {
        return Ok(result);
    }

    let update = match record::parse(stdout) {
        Ok(update) => Some(update),
        Err(FormatError::MissingSeparator) => None,
        Err(e) => return Err(e),
    };
    match update {
        Some(update) => {
            result.headers.extend(update.headers);
            result.body = update.body;
        }
        None => {
            let mut terminated = stdout.to_string();
            if !terminated.ends_with('\n') {
                terminated.push('\n');
            }
            terminated.push('\n');
            result.headers.extend(record::parse(&terminated)?.headers);
        }
    }
    Ok(result)
}

fn first_non_empty(streams: &[&str]) -> Option<String> {
    streams
        .iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(|s| s.chars().take(MAX_REASON_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{Endpoint, FsLeaseBroker, FsSlotStore, WaitBudget};
    use crate::topology::{Instance, StageSpec};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn stage() -> StageSpec {
        StageSpec {
            name: "deduped".into(),
            input: "03_deduped".into(),
            output: "04_clean_checked".into(),
            reject: "52_rejected_cleanliness".into(),
        }
    }

    fn broker(dir: &TempDir, endpoints: Vec<Endpoint>) -> FsLeaseBroker {
        FsLeaseBroker::new(
            FsSlotStore::new(dir.path()).unwrap(),
            endpoints,
            WaitBudget {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                jitter_max: Duration::ZERO,
            },
            CancellationToken::new(),
        )
    }

    fn sh(script: &str) -> CommandTransform {
        CommandTransform {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            capability: None,
            timeout: Duration::from_secs(10),
        }
    }

    fn record() -> JobRecord {
        let mut record = JobRecord::new(Default::default(), "line one\nline two\n");
        record.set_header("Job-ID", "job-42");
        record
    }

    async fn run(
        transform: &CommandTransform,
        leases: &FsLeaseBroker,
    ) -> Result<Verdict, TransformError> {
        let stage = stage();
        let ctx = TransformContext {
            stage: &stage,
            instance: Instance::Priority,
            attempt: 2,
            leases,
        };
        transform.transform(&record(), &ctx).await
    }

    #[tokio::test]
    async fn exit_zero_merges_headers_and_keeps_body() {
        let dir = TempDir::new().unwrap();
        let leases = broker(&dir, Vec::new());
        let transform = sh(
            r#"cat >/dev/null; echo "Seen-Stage: $JOBLINE_STAGE"; echo "Seen-Attempt: $JOBLINE_ATTEMPT/$JOBLINE_INSTANCE/$JOBLINE_JOB_ID""#,
        );

        let Verdict::Accept(out) = run(&transform, &leases).await.unwrap() else {
            panic!("expected accept");
        };
        assert_eq!(out.header("Seen-Stage"), Some("deduped"));
        assert_eq!(out.header("Seen-Attempt"), Some("2/priority/job-42"));
        assert_eq!(out.header("Job-ID"), Some("job-42"));
        assert_eq!(out.body, "line one\nline two\n");
    }

    #[tokio::test]
    async fn body_after_blank_line_replaces_body() {
        let dir = TempDir::new().unwrap();
        let leases = broker(&dir, Vec::new());
        let transform = sh(r#"printf 'Lines: '; wc -l | tr -d ' '; echo; tr a-z A-Z <<EOF
cleaned
EOF"#);

        let Verdict::Accept(out) = run(&transform, &leases).await.unwrap() else {
            panic!("expected accept");
        };
        assert_eq!(out.header("Lines"), Some("2"));
        assert_eq!(out.body, "CLEANED\n");
    }

    #[tokio::test]
    async fn exit_two_is_a_domain_rejection() {
        let dir = TempDir::new().unwrap();
        let leases = broker(&dir, Vec::new());

        let verdict = run(&sh("echo 'duplicate of job-7' >&2; exit 2"), &leases)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::reject("duplicate of job-7"));

        let verdict = run(&sh("exit 2"), &leases).await.unwrap();
        assert_eq!(verdict, Verdict::reject("rejected by sh"));
    }

    #[tokio::test]
    async fn other_failures_are_transient() {
        let dir = TempDir::new().unwrap();
        let leases = broker(&dir, Vec::new());

        let err = run(&sh("echo 'backend 503' >&2; exit 1"), &leases)
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Transient(msg) if msg.contains("backend 503")));

        let missing = CommandTransform {
            program: "/nonexistent/jobline-stage".into(),
            ..sh("")
        };
        let err = run(&missing, &leases).await.unwrap_err();
        assert!(matches!(err, TransformError::Transient(msg) if msg.contains("failed to start")));

        let err = run(&sh("echo 'no colon here'"), &leases).await.unwrap_err();
        assert!(matches!(err, TransformError::Transient(msg) if msg.contains("malformed")));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let dir = TempDir::new().unwrap();
        let leases = broker(&dir, Vec::new());
        let slow = CommandTransform {
            timeout: Duration::from_millis(100),
            ..sh("sleep 5")
        };

        let err = run(&slow, &leases).await.unwrap_err();
        assert!(matches!(err, TransformError::Transient(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn capability_leases_an_endpoint_for_the_run() {
        let dir = TempDir::new().unwrap();
        let leases = broker(
            &dir,
            vec![Endpoint {
                id: "gpu-a".into(),
                url: "http://gpu-a:11434".into(),
                capacity: 1,
                capabilities: vec!["llama3".into()],
            }],
        );
        let transform = CommandTransform {
            capability: Some("llama3".into()),
            ..sh(r#"echo "Endpoint: $JOBLINE_ENDPOINT_ID $JOBLINE_ENDPOINT_URL""#)
        };

        let Verdict::Accept(out) = run(&transform, &leases).await.unwrap() else {
            panic!("expected accept");
        };
        assert_eq!(out.header("Endpoint"), Some("gpu-a http://gpu-a:11434"));
        assert!(leases.store().snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_capability_defers() {
        let dir = TempDir::new().unwrap();
        let leases = broker(&dir, Vec::new());
        let transform = CommandTransform {
            capability: Some("gpt-oss".into()),
            ..sh("exit 0")
        };

        let err = run(&transform, &leases).await.unwrap_err();
        assert!(matches!(err, TransformError::ResourceExhausted(_)));
    }

    #[test]
    fn headers_only_output_keeps_body() {
        let merged = apply_output(&record(), "Category: news").unwrap();
        assert_eq!(merged.header("Category"), Some("news"));
        assert_eq!(merged.body, record().body);

        assert_eq!(apply_output(&record(), "\n  \n").unwrap(), record());
    }
}
