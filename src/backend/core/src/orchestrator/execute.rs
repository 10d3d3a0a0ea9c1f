//! Execution orchestration.
//!
//! Given a job payload, execution does exactly two things: write the
//! running-status record and atomically bump the queue's running counter.
//! The two writes are independent, with no combined transaction; under
//! at-least-once retry of the whole orchestration, both eventually reflect
//! the job. Either failure surfaces as `ExecutionFailed` and is retried by
//! whichever component invoked execution, never internally.
//!
//! Duplicate invocation for the same job id overwrites the status record
//! and increments the counter again. That double-increment on redelivery is
//! accepted at-least-once behavior, kept as-is.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tracing::info;

use crate::error::{ErrorCode, ManovaleError, Result};
use crate::job::JobPayload;
use crate::store::{RecordKey, StoreBackend, StoredRecord, TOTAL_COUNT_FIELD};

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

/// The execution submission entry point.
///
/// Invoked synchronously on the immediate path and asynchronously by the
/// Expiry Watcher after a delayed job's expiry. Implementations must be safe
/// to invoke more than once for the same job id.
#[async_trait]
pub trait ExecuteJob: Send + Sync {
    /// Hand a job to execution.
    ///
    /// # Errors
    ///
    /// `MalformedJob` for structurally invalid payloads (fatal),
    /// `ExecutionFailed` when either store write fails (retryable by the
    /// caller).
    async fn execute(&self, job: JobPayload) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Orchestrator
// ═══════════════════════════════════════════════════════════════════════════════

/// Marks jobs running in the store and maintains the per-queue running
/// counters.
pub struct ExecutionOrchestrator {
    store: Arc<dyn StoreBackend>,
}

impl ExecutionOrchestrator {
    /// Create a new execution orchestrator over `store`.
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self { store }
    }

    fn execution_failed(stage: &'static str, job: &JobPayload, source: ManovaleError) -> ManovaleError {
        ManovaleError::with_internal(
            ErrorCode::ExecutionFailed,
            "Job execution failed",
            format!("{stage} failed for job {}", job.id),
        )
        .with_context("stage", stage)
        .with_context("job_id", job.id.as_str())
        .with_context("queue", job.queue.as_str())
        .with_source(source)
    }
}

#[async_trait]
impl ExecuteJob for ExecutionOrchestrator {
    async fn execute(&self, job: JobPayload) -> Result<()> {
        job.validate()?;

        // (a) status record
        let record = StoredRecord::running_job(&job)?;
        self.store
            .put(record)
            .await
            .map_err(|e| Self::execution_failed("status write", &job, e))?;

        // (b) counter increment
        let total = self
            .store
            .increment(RecordKey::queue_counter(&job.queue), TOTAL_COUNT_FIELD, 1)
            .await
            .map_err(|e| Self::execution_failed("counter increment", &job, e))?;

        counter!("manovale_jobs_executed_total", "queue" => job.queue.clone()).increment(1);
        info!(
            job_id = %job.id,
            queue = %job.queue,
            running_total = total,
            "Job marked running"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreConfig};

    fn harness() -> (Arc<InMemoryStore>, ExecutionOrchestrator) {
        let store = Arc::new(InMemoryStore::new(StoreConfig::default()));
        let orchestrator = ExecutionOrchestrator::new(store.clone() as Arc<dyn StoreBackend>);
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_execute_writes_status_and_counter() {
        let (store, orchestrator) = harness();
        let job = JobPayload::new("j1", "q1");

        orchestrator.execute(job.clone()).await.unwrap();

        let record = store
            .record(&RecordKey::running_job("q1", &job.id))
            .await
            .expect("running record");
        assert_eq!(
            record.attribute(crate::store::STATUS_ATTRIBUTE),
            Some(&serde_json::json!("running"))
        );
        assert_eq!(store.counter_value("q1").await, Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_execution_increments_twice() {
        let (store, orchestrator) = harness();
        let job = JobPayload::new("j1", "q1");

        orchestrator.execute(job.clone()).await.unwrap();
        orchestrator.execute(job).await.unwrap();

        // At-least-once delivery: the counter over-counts on redelivery.
        assert_eq!(store.counter_value("q1").await, Some(2));
    }

    #[tokio::test]
    async fn test_queues_count_independently() {
        let (store, orchestrator) = harness();

        orchestrator.execute(JobPayload::new("j1", "q1")).await.unwrap();
        orchestrator.execute(JobPayload::new("j2", "q2")).await.unwrap();
        orchestrator.execute(JobPayload::new("j3", "q2")).await.unwrap();

        assert_eq!(store.counter_value("q1").await, Some(1));
        assert_eq!(store.counter_value("q2").await, Some(2));
    }

    #[tokio::test]
    async fn test_malformed_job_is_rejected_before_any_write() {
        let (store, orchestrator) = harness();

        let err = orchestrator
            .execute(JobPayload::new("j1", ""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedJob);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_execution_failed() {
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

        let orchestrator = ExecutionOrchestrator::new(Arc::new(FailingStore));
        let err = orchestrator
            .execute(JobPayload::new("j1", "q1"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ExecutionFailed);
        assert!(err.is_retryable());
    }
}
