//! End-to-end tests for the dispatch pipelines.
//!
//! These wire the real components together — store with TTL sweeper, expiry
//! watcher, orchestrators, dead-letter channel — and verify the observable
//! scenarios: delayed jobs run after expiry, immediate jobs run at once,
//! malformed elements are isolated and dead-lettered, and redelivery
//! over-counts (documented at-least-once behavior).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use manovale_core::dlq::InMemoryDeadLetter;
use manovale_core::job::{JobDelay, JobPayload};
use manovale_core::orchestrator::{ExecutionOrchestrator, SubmitOrchestrator, SubmitOutcome};
use manovale_core::retry::BackoffStrategy;
use manovale_core::store::{
    InMemoryStore, RecordKey, StoreBackend, StoreConfig, StoredRecord, SweeperHandle,
    DELAYED_JOBS_PARTITION, TTL_ATTRIBUTE,
};
use manovale_core::watcher::{ExpiryWatcher, WatcherConfig, WatcherHandle};

// ============================================================================
// Test Harness
// ============================================================================

struct Harness {
    store: Arc<InMemoryStore>,
    dead_letter: Arc<InMemoryDeadLetter>,
    submitter: SubmitOrchestrator,
    sweeper: SweeperHandle,
    watcher: WatcherHandle,
}

impl Harness {
    async fn start() -> Self {
        let store = Arc::new(InMemoryStore::new(StoreConfig {
            sweep_interval: Duration::from_millis(25),
            ..Default::default()
        }));
        let sweeper = store.clone().start_sweeper();

        let dead_letter = Arc::new(InMemoryDeadLetter::default());
        let executor = Arc::new(ExecutionOrchestrator::new(
            store.clone() as Arc<dyn StoreBackend>
        ));

        let feed = store.subscribe().await;
        let watcher = ExpiryWatcher::new(
            executor.clone(),
            dead_letter.clone(),
            WatcherConfig {
                batch_wait: Duration::from_millis(10),
                retry_backoff: BackoffStrategy::fixed(1),
                ..Default::default()
            },
        )
        .start(feed);

        let submitter =
            SubmitOrchestrator::new(store.clone() as Arc<dyn StoreBackend>, executor);

        Self {
            store,
            dead_letter,
            submitter,
            sweeper,
            watcher,
        }
    }

    async fn stop(self) {
        self.watcher.stop().await;
        self.sweeper.stop().await;
    }
}

// ============================================================================
// Delayed Path
// ============================================================================

#[tokio::test]
async fn delayed_job_runs_after_expiry_and_not_before() {
    let harness = Harness::start().await;

    let job = JobPayload::new("j1", "q1").with_delay(JobDelay::seconds(1));
    let outcome = harness.submitter.submit(job.clone()).await.unwrap();
    assert!(outcome.is_deferred());

    // Before expiry: parked, not running, no counter.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness
        .store
        .record(&RecordKey::delayed_job(&job.id))
        .await
        .is_some());
    assert!(harness
        .store
        .record(&RecordKey::running_job("q1", &job.id))
        .await
        .is_none());
    assert_eq!(harness.store.counter_value("q1").await, None);

    // After expiry plus eviction latency: running, counted, no longer parked.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(harness
        .store
        .record(&RecordKey::delayed_job(&job.id))
        .await
        .is_none());
    assert!(harness
        .store
        .record(&RecordKey::running_job("q1", &job.id))
        .await
        .is_some());
    assert_eq!(harness.store.counter_value("q1").await, Some(1));
    assert_eq!(harness.watcher.stats().dispatched(), 1);

    harness.stop().await;
}

// ============================================================================
// Immediate Path
// ============================================================================

#[tokio::test]
async fn immediate_job_runs_synchronously_without_a_delayed_record() {
    let harness = Harness::start().await;

    let job = JobPayload::new("j2", "q1");
    let outcome = harness.submitter.submit(job.clone()).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Executed);

    // Synchronously visible, no waiting on the watcher.
    assert!(harness
        .store
        .record(&RecordKey::running_job("q1", &job.id))
        .await
        .is_some());
    assert_eq!(harness.store.counter_value("q1").await, Some(1));
    assert!(harness
        .store
        .record(&RecordKey::delayed_job(&job.id))
        .await
        .is_none());

    harness.stop().await;
}

#[tokio::test]
async fn resubmitting_the_same_job_overwrites_and_counts_again() {
    let harness = Harness::start().await;

    let job = JobPayload::new("j3", "q1");
    harness.submitter.submit(job.clone()).await.unwrap();
    harness.submitter.submit(job).await.unwrap();

    // At-least-once semantics: the aggregate over-counts on resubmission.
    assert_eq!(harness.store.counter_value("q1").await, Some(2));

    harness.stop().await;
}

// ============================================================================
// Failure Isolation & Dead-Letter Routing
// ============================================================================

#[tokio::test]
async fn malformed_delayed_record_is_dead_lettered_while_siblings_run() {
    let harness = Harness::start().await;

    // A healthy delayed job, already expired.
    let good = JobPayload::new("good", "q1");
    let expired = Utc::now() - chrono::Duration::seconds(1);
    harness
        .store
        .put(StoredRecord::delayed_job(&good, expired).unwrap())
        .await
        .unwrap();

    // A record that passes the expiry filter but carries no job payload.
    let mut attributes = serde_json::Map::new();
    attributes.insert(TTL_ATTRIBUTE.to_string(), serde_json::json!(0));
    harness
        .store
        .put(StoredRecord {
            key: RecordKey::new(DELAYED_JOBS_PARTITION, "broken"),
            attributes,
            expires_at: Some(expired),
        })
        .await
        .unwrap();

    // Both are evicted in the same sweep and arrive in the same batch.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(harness
        .store
        .record(&RecordKey::running_job("q1", &good.id))
        .await
        .is_some());
    assert_eq!(harness.store.counter_value("q1").await, Some(1));

    let parked = harness.dead_letter.drain().await;
    assert_eq!(parked.len(), 1);
    assert_eq!(
        parked[0].error_code,
        manovale_core::error::ErrorCode::MalformedJob
    );

    harness.stop().await;
}

// ============================================================================
// At-Least-Once Redelivery
// ============================================================================

#[tokio::test]
async fn redelivered_execution_increments_the_counter_twice() {
    let harness = Harness::start().await;

    let executor = ExecutionOrchestrator::new(harness.store.clone() as Arc<dyn StoreBackend>);
    let job = JobPayload::new("j4", "q1");

    // Simulate the watcher delivering the same expiry event twice.
    use manovale_core::orchestrator::ExecuteJob;
    executor.execute(job.clone()).await.unwrap();
    executor.execute(job).await.unwrap();

    assert_eq!(harness.store.counter_value("q1").await, Some(2));

    harness.stop().await;
}
