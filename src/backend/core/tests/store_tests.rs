//! Integration tests for the job store.
//!
//! These exercise the store's externally observable contract: TTL eviction,
//! the ordered change feed with pre-mutation images, and the atomicity of
//! counter increments.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use manovale_core::job::JobPayload;
use manovale_core::store::{
    ChangeKind, InMemoryStore, RecordKey, StoreBackend, StoreConfig, StoredRecord,
    TOTAL_COUNT_FIELD, TTL_ATTRIBUTE,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn fast_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new(StoreConfig {
        sweep_interval: Duration::from_millis(25),
        ..Default::default()
    }))
}

// ============================================================================
// TTL Eviction
// ============================================================================

#[tokio::test]
async fn delayed_record_lives_until_expiry_then_vanishes() {
    let store = fast_store();
    let sweeper = store.clone().start_sweeper();

    let job = JobPayload::new("j1", "q1");
    let expiry = Utc::now() + chrono::Duration::milliseconds(300);
    let record = StoredRecord::delayed_job(&job, expiry).unwrap();
    let key = record.key.clone();

    store.put(record).await.unwrap();

    // Still pending well before expiry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.record(&key).await.is_some());

    // Gone some bounded time after expiry.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.record(&key).await.is_none());

    sweeper.stop().await;
}

#[tokio::test]
async fn eviction_emits_removal_with_pre_removal_image() {
    let store = fast_store();
    let mut feed = store.subscribe().await;

    let job = JobPayload::new("j1", "q1").with_field("marker", 42);
    let expiry = Utc::now() - chrono::Duration::seconds(1);
    let record = StoredRecord::delayed_job(&job, expiry).unwrap();
    store.put(record.clone()).await.unwrap();
    store.sweep_expired().await;

    let insert = feed.recv().await.unwrap();
    assert_eq!(insert.kind, ChangeKind::Insert);

    let removal = feed.recv().await.unwrap();
    assert_eq!(removal.kind, ChangeKind::Remove);
    assert!(removal.is_expiry_removal());

    let image = removal.old_image.unwrap();
    assert!(image.attribute(TTL_ATTRIBUTE).is_some());
    let embedded = image.job_payload().unwrap();
    assert_eq!(embedded.extra.get("marker"), Some(&serde_json::json!(42)));
}

#[tokio::test]
async fn records_without_ttl_are_never_evicted() {
    let store = fast_store();
    let sweeper = store.clone().start_sweeper();

    let job = JobPayload::new("j1", "q1");
    let record = StoredRecord::running_job(&job).unwrap();
    let key = record.key.clone();
    store.put(record).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.record(&key).await.is_some());

    sweeper.stop().await;
}

// ============================================================================
// Change Feed Ordering
// ============================================================================

#[tokio::test]
async fn feed_sequence_is_strictly_increasing_across_mixed_mutations() {
    let store = fast_store();
    let mut feed = store.subscribe().await;

    for i in 0..5 {
        let job = JobPayload::new(format!("j{i}"), "q1");
        store
            .put(StoredRecord::running_job(&job).unwrap())
            .await
            .unwrap();
        store
            .increment(RecordKey::queue_counter("q1"), TOTAL_COUNT_FIELD, 1)
            .await
            .unwrap();
    }

    let mut last_sequence = 0;
    for _ in 0..10 {
        let event = feed.recv().await.unwrap();
        assert!(event.sequence > last_sequence);
        last_sequence = event.sequence;
    }
}

// ============================================================================
// Atomic Increment
// ============================================================================

#[tokio::test]
async fn concurrent_increments_lose_no_updates() {
    let store = fast_store();
    let mut handles = Vec::new();

    for _ in 0..100 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .increment(RecordKey::queue_counter("q1"), TOTAL_COUNT_FIELD, 1)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.counter_value("q1").await, Some(100));
}

#[tokio::test]
async fn increment_creates_the_counter_record_on_first_use() {
    let store = fast_store();
    assert_eq!(store.counter_value("q1").await, None);

    let value = store
        .increment(RecordKey::queue_counter("q1"), TOTAL_COUNT_FIELD, 1)
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(store.counter_value("q1").await, Some(1));
}
