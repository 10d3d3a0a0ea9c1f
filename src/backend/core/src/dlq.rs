//! Dead-letter channel for events that exhausted retry without success.
//!
//! Nothing is silently dropped: malformed payloads and elements that kept
//! failing after the watcher's retries land here for manual inspection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ErrorCode, ManovaleError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Dead-Letter Record
// ═══════════════════════════════════════════════════════════════════════════════

/// An event parked on the dead-letter channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The payload exactly as it was delivered to the failing consumer
    pub payload: serde_json::Value,

    /// Human-readable reason for dead-lettering
    pub reason: String,

    /// Error code of the final failure
    pub error_code: ErrorCode,

    /// How many delivery attempts were made before giving up
    pub attempts: u32,

    /// When the record was parked
    pub enqueued_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Create a new dead-letter record.
    pub fn new(
        payload: serde_json::Value,
        reason: impl Into<String>,
        error_code: ErrorCode,
        attempts: u32,
    ) -> Self {
        Self {
            payload,
            reason: reason.into(),
            error_code,
            attempts,
            enqueued_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dead-Letter Channel Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for dead-letter destinations.
#[async_trait]
pub trait DeadLetterChannel: Send + Sync + std::fmt::Debug {
    /// Park a record on the channel.
    async fn publish(&self, record: DeadLetterRecord) -> Result<()>;

    /// Number of records currently parked.
    async fn len(&self) -> Result<usize>;

    /// Get the channel name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Channel
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory dead-letter channel for testing and development.
///
/// Bounded: once full, the oldest record is dropped to make room (with a
/// warning, since that record is then lost to inspection).
#[derive(Debug)]
pub struct InMemoryDeadLetter {
    records: RwLock<VecDeque<DeadLetterRecord>>,
    max_size: usize,
}

impl InMemoryDeadLetter {
    /// Create a channel holding at most `max_size` records.
    pub fn new(max_size: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_size,
        }
    }

    /// Remove and return all parked records.
    pub async fn drain(&self) -> Vec<DeadLetterRecord> {
        self.records.write().await.drain(..).collect()
    }
}

impl Default for InMemoryDeadLetter {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl DeadLetterChannel for InMemoryDeadLetter {
    async fn publish(&self, record: DeadLetterRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.len() >= self.max_size {
            warn!(max_size = self.max_size, "Dead-letter channel full, dropping oldest record");
            records.pop_front();
        }

        debug!(
            reason = %record.reason,
            error_code = %record.error_code,
            attempts = record.attempts,
            "Record dead-lettered"
        );
        records.push_back(record);

        counter!("manovale_dead_letters_total", "channel" => "in_memory").increment(1);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Channel
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed dead-letter channel for production use.
///
/// Records are serialized and pushed onto a named list.
#[derive(Debug)]
pub struct RedisDeadLetter {
    client: redis::Client,
    queue_key: String,
}

impl RedisDeadLetter {
    /// Create a new Redis dead-letter channel.
    ///
    /// # Arguments
    /// * `client` - A connected Redis client
    /// * `queue_key` - The Redis list key to use (e.g. `"ManovaleDlq"`)
    pub fn new(client: redis::Client, queue_key: impl Into<String>) -> Self {
        Self {
            client,
            queue_key: queue_key.into(),
        }
    }

    /// Obtain an async multiplexed connection from the Redis client.
    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ManovaleError::with_internal(
                    ErrorCode::DeadLetterUnavailable,
                    "Failed to get Redis connection for dead-letter channel",
                    e.to_string(),
                )
            })
    }
}

#[async_trait]
impl DeadLetterChannel for RedisDeadLetter {
    async fn publish(&self, record: DeadLetterRecord) -> Result<()> {
        let serialized = serde_json::to_string(&record)?;

        let mut conn = self.get_conn().await?;
        redis::cmd("RPUSH")
            .arg(&self.queue_key)
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                ManovaleError::with_internal(
                    ErrorCode::DeadLetterError,
                    "Failed to publish to the dead-letter channel",
                    e.to_string(),
                )
            })?;

        debug!(
            queue = %self.queue_key,
            reason = %record.reason,
            attempts = record.attempts,
            "Record dead-lettered"
        );
        counter!("manovale_dead_letters_total", "channel" => "redis").increment(1);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let length: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                ManovaleError::with_internal(
                    ErrorCode::DeadLetterError,
                    "Failed to get dead-letter channel length",
                    e.to_string(),
                )
            })?;

        Ok(length)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reason: &str) -> DeadLetterRecord {
        DeadLetterRecord::new(
            serde_json::json!({"id": "j1"}),
            reason,
            ErrorCode::ExecutionFailed,
            3,
        )
    }

    #[tokio::test]
    async fn test_publish_and_drain() {
        let dlq = InMemoryDeadLetter::default();

        dlq.publish(record("first")).await.unwrap();
        dlq.publish(record("second")).await.unwrap();
        assert_eq!(dlq.len().await.unwrap(), 2);

        let drained = dlq.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].reason, "first");
        assert_eq!(dlq.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bounded_channel_drops_oldest() {
        let dlq = InMemoryDeadLetter::new(2);

        dlq.publish(record("first")).await.unwrap();
        dlq.publish(record("second")).await.unwrap();
        dlq.publish(record("third")).await.unwrap();

        let drained = dlq.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].reason, "second");
        assert_eq!(drained[1].reason, "third");
    }

    #[test]
    fn test_record_serializes_with_code() {
        let value = serde_json::to_value(record("boom")).unwrap();
        assert_eq!(value["error_code"], serde_json::json!("EXECUTION_FAILED"));
        assert_eq!(value["attempts"], serde_json::json!(3));
    }
}
