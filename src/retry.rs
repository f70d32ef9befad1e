//! Bounded retries around a stage transform.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TransformError;
use crate::record::JobRecord;
use crate::state_machine::FailureKind;
use crate::transform::Verdict;

fn default_max_attempts() -> u32 {
    3
}

/// Per-record retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total transform attempts per record, first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff. Zero retries immediately.
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

/// How a record left the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Accepted(JobRecord),
    Rejected(FailureKind),
    /// No capacity; hand the record back without spending its budget.
    Deferred(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub resolution: Resolution,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Effective attempt budget; never below one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// delay = backoff_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }

    /// Runs `op` until it yields a verdict, a deferral, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Transient errors and panics
    /// are retried; a domain rejection ends the loop on the spot.
    pub async fn run<F, Fut>(&self, mut op: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Verdict, TransformError>>,
    {
        let budget = self.attempts();
        let mut last_error = String::new();

        for attempt in 1..=budget {
            let result = match AssertUnwindSafe(op(attempt)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(TransformError::Transient(format!(
                    "transform panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            match result {
                Ok(Verdict::Accept(record)) => {
                    return RetryOutcome {
                        resolution: Resolution::Accepted(record),
                        attempts: attempt,
                    };
                }
                Ok(Verdict::Reject { reason }) => {
                    return RetryOutcome {
                        resolution: Resolution::Rejected(FailureKind::Domain(reason)),
                        attempts: attempt,
                    };
                }
                Err(TransformError::ResourceExhausted(reason)) => {
                    debug!(attempt, %reason, "transform deferred");
                    return RetryOutcome {
                        resolution: Resolution::Deferred(reason),
                        attempts: attempt - 1,
                    };
                }
                Err(TransformError::Transient(reason)) => {
                    warn!(attempt, max_attempts = budget, %reason, "transient transform failure");
                    last_error = reason;
                }
            }

            if attempt < budget {
                let delay = self.delay_for_attempt(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        RetryOutcome {
            resolution: Resolution::Rejected(FailureKind::Transient(format!(
                "transient failure after {budget} attempts: {last_error}"
            ))),
            attempts: budget,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
