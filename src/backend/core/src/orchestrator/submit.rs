//! Submission orchestration.
//!
//! A two-branch decision: jobs carrying a delay are parked as expiring
//! records in the store (the Expiry Watcher resumes them later); jobs
//! without one are forwarded straight to execution. Both branches converge
//! to a single terminal success, distinguishable only by which path was
//! taken.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ErrorCode, ManovaleError, Result};
use crate::job::JobPayload;
use crate::orchestrator::execute::ExecuteJob;
use crate::retry::RetryPolicy;
use crate::store::{StoreBackend, StoredRecord};

// ═══════════════════════════════════════════════════════════════════════════════
// Submit Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Terminal signal of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The job was parked as a delayed record; it stays dormant until the
    /// store evicts it at `expires_at` (plus eviction latency)
    Deferred { expires_at: DateTime<Utc> },
    /// The job was executed synchronously
    Executed,
}

impl SubmitOutcome {
    /// Whether this submission took the delayed path.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submit Orchestrator
// ═══════════════════════════════════════════════════════════════════════════════

/// Receives submitted jobs and routes them by delay presence.
pub struct SubmitOrchestrator {
    store: Arc<dyn StoreBackend>,
    executor: Arc<dyn ExecuteJob>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SubmitOrchestrator {
    /// Create a new submit orchestrator.
    pub fn new(store: Arc<dyn StoreBackend>, executor: Arc<dyn ExecuteJob>) -> Self {
        Self {
            store,
            executor,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
        }
    }

    /// Set the retry policy for the immediate-execution path.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Submit a job.
    ///
    /// # Errors
    ///
    /// `MalformedJob` for invalid payloads, `SubmitFailed` when the delayed
    /// record could not be written (not retried at this layer),
    /// `ExecutionFailed`/`DispatchTimeout` when the immediate path exhausts
    /// its retries.
    pub async fn submit(&self, job: JobPayload) -> Result<SubmitOutcome> {
        job.validate()?;

        match job.delay {
            Some(delay) => {
                let expires_at = delay.resolve(Utc::now());
                let record = StoredRecord::delayed_job(&job, expires_at)?;

                self.store.put(record).await.map_err(|e| {
                    ManovaleError::with_internal(
                        ErrorCode::SubmitFailed,
                        "Failed to park the delayed job",
                        format!("delayed-record write failed for job {}", job.id),
                    )
                    .with_context("job_id", job.id.as_str())
                    .with_source(e)
                })?;

                counter!("manovale_jobs_submitted_total", "path" => "deferred").increment(1);
                info!(
                    job_id = %job.id,
                    queue = %job.queue,
                    expires_at = %expires_at,
                    "Job deferred until expiry"
                );
                Ok(SubmitOutcome::Deferred { expires_at })
            }
            None => {
                self.run_execution(&job).await?;

                counter!("manovale_jobs_submitted_total", "path" => "immediate").increment(1);
                info!(job_id = %job.id, queue = %job.queue, "Job executed immediately");
                Ok(SubmitOutcome::Executed)
            }
        }
    }

    /// Drive the execution call under the configured timeout, retrying
    /// retryable failures up to the policy's bound.
    async fn run_execution(&self, job: &JobPayload) -> Result<()> {
        let mut attempt = 0;
        loop {
            let outcome =
                tokio::time::timeout(self.timeout, self.executor.execute(job.clone())).await;

            let error = match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => ManovaleError::new(
                    ErrorCode::DispatchTimeout,
                    "Execution did not complete within the invocation timeout",
                )
                .with_context("job_id", job.id.as_str()),
            };

            if !self.retry.should_retry(attempt, &error) {
                return Err(error);
            }

            let delay = self.retry.next_retry_delay(attempt);
            warn!(
                job_id = %job.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Execution failed, retrying"
            );
            counter!("manovale_execution_retries_total").increment(1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDelay;
    use crate::orchestrator::execute::ExecutionOrchestrator;
    use crate::retry::BackoffStrategy;
    use crate::store::{InMemoryStore, RecordKey, StoreConfig, TTL_ATTRIBUTE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn harness() -> (Arc<InMemoryStore>, SubmitOrchestrator) {
        let store = Arc::new(InMemoryStore::new(StoreConfig::default()));
        let executor = Arc::new(ExecutionOrchestrator::new(
            store.clone() as Arc<dyn StoreBackend>
        ));
        let orchestrator =
            SubmitOrchestrator::new(store.clone() as Arc<dyn StoreBackend>, executor);
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_delayed_job_is_parked_not_executed() {
        let (store, orchestrator) = harness();
        let job = JobPayload::new("j1", "q1").with_delay(JobDelay::seconds(60));

        let outcome = orchestrator.submit(job.clone()).await.unwrap();
        assert!(outcome.is_deferred());

        let record = store
            .record(&RecordKey::delayed_job(&job.id))
            .await
            .expect("delayed record");
        assert!(record.attribute(TTL_ATTRIBUTE).is_some());

        // No running record and no counter before expiry.
        assert!(store
            .record(&RecordKey::running_job("q1", &job.id))
            .await
            .is_none());
        assert_eq!(store.counter_value("q1").await, None);
    }

    #[tokio::test]
    async fn test_immediate_job_executes_synchronously() {
        let (store, orchestrator) = harness();
        let job = JobPayload::new("j2", "q1");

        let outcome = orchestrator.submit(job.clone()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Executed);

        assert!(store
            .record(&RecordKey::running_job("q1", &job.id))
            .await
            .is_some());
        assert_eq!(store.counter_value("q1").await, Some(1));

        // The immediate path never touches the delayed partition.
        assert!(store
            .record(&RecordKey::delayed_job(&job.id))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_submission_is_rejected() {
        let (_store, orchestrator) = harness();
        let err = orchestrator
            .submit(JobPayload::new("", "q1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedJob);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_submit_failed() {
        struct FailingStore;

        #[async_trait]
        impl StoreBackend for FailingStore {
            async fn put(&self, _record: StoredRecord) -> Result<()> {
                Err(ManovaleError::store_unavailable("outage"))
            }
            async fn increment(
                &self,
                _key: RecordKey,
                _field: &str,
                _amount: i64,
            ) -> Result<i64> {
                Err(ManovaleError::store_unavailable("outage"))
            }
            async fn subscribe(&self) -> crate::store::FeedSubscription {
                unimplemented!("not used in this test")
            }
            fn name(&self) -> &'static str {
                "failing"
            }
        }

        let store: Arc<dyn StoreBackend> = Arc::new(FailingStore);
        let executor = Arc::new(ExecutionOrchestrator::new(store.clone()));
        let orchestrator = SubmitOrchestrator::new(store, executor);

        let job = JobPayload::new("j1", "q1").with_delay(JobDelay::seconds(60));
        let err = orchestrator.submit(job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubmitFailed);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_immediate_path_retries_transient_execution_failures() {
        struct FlakyExecutor {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ExecuteJob for FlakyExecutor {
            async fn execute(&self, _job: JobPayload) -> Result<()> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ManovaleError::new(
                        ErrorCode::ExecutionFailed,
                        "transient failure",
                    ))
                } else {
                    Ok(())
                }
            }
        }

        let store = Arc::new(InMemoryStore::new(StoreConfig::default()));
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
        });
        let orchestrator = SubmitOrchestrator::new(store as Arc<dyn StoreBackend>, executor.clone())
            .with_retry_policy(RetryPolicy {
                max_attempts: 2,
                backoff: BackoffStrategy::fixed(1),
            });

        let outcome = orchestrator.submit(JobPayload::new("j1", "q1")).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Executed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }
}
