//! Durable step execution.
//!
//! [`StepRunner`] is the interpreter that makes workflows resumable: each
//! named step is looked up in the [`StepLog`] first, executed with bounded
//! retries only when no record exists, and its outcome persisted before
//! control returns to the workflow. Re-entering an instance therefore
//! skips straight to the first step with no recorded result.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::store::{StepLog, StepOutcome, StepRecord};
use crate::workflow::InstanceId;

/// Executes named steps with memoization and bounded exponential-backoff
/// retry.
#[derive(Clone)]
pub struct StepRunner {
    log: Arc<dyn StepLog>,
    retry: RetryPolicy,
}

impl StepRunner {
    pub fn new(log: Arc<dyn StepLog>, retry: RetryPolicy) -> Self {
        Self { log, retry }
    }

    /// The log this runner records into, for inspecting instance history.
    pub fn log(&self) -> &dyn StepLog {
        self.log.as_ref()
    }

    /// Run a named step for an instance.
    ///
    /// If the log already holds a result for `(instance, step)`, it is
    /// returned without executing `f`: a recorded success deserializes to
    /// `T`, a recorded failure yields `StepFailed` again. Otherwise `f`
    /// runs under the retry policy, and the final outcome (success or
    /// terminal failure) is recorded before this method returns.
    ///
    /// Only errors classified retryable are retried; anything else is
    /// terminal on the first occurrence.
    #[tracing::instrument(skip(self, f), fields(instance = %instance, step = step))]
    pub async fn run<T, F, Fut>(&self, instance: &InstanceId, step: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(record) = self.log.get_step(instance, step).await? {
            return replay(record, step);
        }

        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => {
                    let recorded = serde_json::to_value(&value)?;
                    self.log
                        .record_step(instance, step, StepOutcome::Ok(recorded))
                        .await?;
                    tracing::debug!(attempt = attempt, "Step completed");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Step failed, retrying with exponential backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = attempt, "Step failed terminally");
                    self.log
                        .record_step(instance, step, StepOutcome::Failed(e.to_string()))
                        .await?;
                    return Err(Error::StepFailed {
                        step: step.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Turn a recorded outcome back into the step's return value.
fn replay<T: DeserializeOwned>(record: StepRecord, step: &str) -> Result<T> {
    match record.outcome {
        StepOutcome::Ok(value) => {
            tracing::debug!("Replaying recorded step result");
            Ok(serde_json::from_value(value)?)
        }
        StepOutcome::Failed(message) => {
            tracing::debug!("Replaying recorded step failure");
            Err(Error::StepFailed {
                step: step.to_string(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner(max_attempts: u32) -> StepRunner {
        StepRunner::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy {
                max_attempts,
                backoff_ms: 1,
                backoff_factor: 2,
                max_backoff_ms: 5,
            },
        )
    }

    fn instance() -> InstanceId {
        InstanceId::from(format!("test/{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn recorded_steps_are_not_executed_again() {
        let runner = runner(3);
        let instance = instance();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        let first: u64 = runner
            .run(&instance, "compute", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42u64)
                }
            })
            .await
            .unwrap();
        assert_eq!(first, 42);

        let calls_in = calls.clone();
        let second: u64 = runner
            .run(&instance, "compute", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7u64)
                }
            })
            .await
            .unwrap();

        // The recorded result wins; the closure never ran again
        assert_eq!(second, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_until_success() {
        let runner = runner(3);
        let instance = instance();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        let value: String = runner
            .run(&instance, "flaky", move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Store("connection reset".to_string()))
                    } else {
                        Ok("done".to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_record_a_terminal_failure() {
        let runner = runner(2);
        let instance = instance();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_in = calls.clone();
        let result: Result<u64> = runner
            .run(&instance, "doomed", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Store("still down".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::StepFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The failure is part of history now: a replay yields it without
        // running the closure
        let calls_in = calls.clone();
        let replayed: Result<u64> = runner
            .run(&instance, "doomed", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u64)
                }
            })
            .await;

        assert!(matches!(replayed, Err(Error::StepFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_on_first_attempt() {
        let runner = runner(5);
        let instance = instance();
        let calls = Arc::new(AtomicUsize::new(0));

        let id = crate::song::SongId::from(uuid::Uuid::new_v4());
        let calls_in = calls.clone();
        let result: Result<u64> = runner
            .run(&instance, "lookup", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::RequestNotFound(id))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::StepFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn steps_are_recorded_in_execution_order() {
        let runner = runner(3);
        let instance = instance();

        let _: u64 = runner
            .run(&instance, "first", || async { Ok(1u64) })
            .await
            .unwrap();
        runner
            .run(&instance, "second", || async { Ok(()) })
            .await
            .unwrap();

        let steps = runner.log().list_steps(&instance).await.unwrap();
        let names: Vec<&str> = steps.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
