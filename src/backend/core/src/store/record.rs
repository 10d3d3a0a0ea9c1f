//! Keys and records for the single-table job store.
//!
//! One logical table, two-part key (`pk` partition key, `sk` sort key),
//! three record kinds:
//!
//! - delayed jobs under the `job:delayed` partition, expiring on the `delay`
//!   attribute
//! - running jobs under their queue's partition
//! - per-queue running counters under the `jobs:count:running` partition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{ErrorCode, ManovaleError, Result};
use crate::job::{JobId, JobPayload, JobStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Table Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// Partition holding delayed-job records awaiting expiry.
pub const DELAYED_JOBS_PARTITION: &str = "job:delayed";

/// Partition holding the per-queue running counters.
pub const RUNNING_COUNTS_PARTITION: &str = "jobs:count:running";

/// Counter field on queue-counter records.
pub const TOTAL_COUNT_FIELD: &str = "TotalCount";

/// Attribute the store watches for time-to-live eviction.
pub const TTL_ATTRIBUTE: &str = "delay";

/// Attribute carrying the opaque job payload.
pub const JOB_ATTRIBUTE: &str = "job";

/// Attribute carrying the execution status on running-job records.
pub const STATUS_ATTRIBUTE: &str = "status";

// ═══════════════════════════════════════════════════════════════════════════════
// Record Key
// ═══════════════════════════════════════════════════════════════════════════════

/// Two-part primary key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Partition key
    pub pk: String,
    /// Sort key
    pub sk: String,
}

impl RecordKey {
    /// Create a key from raw parts.
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    /// Key of the delayed-job record for `job_id`.
    pub fn delayed_job(job_id: &JobId) -> Self {
        Self::new(DELAYED_JOBS_PARTITION, job_id.as_str())
    }

    /// Key of the running-job record for `job_id` on `queue`.
    pub fn running_job(queue: &str, job_id: &JobId) -> Self {
        Self::new(queue, job_id.as_str())
    }

    /// Key of the running counter for `queue`.
    pub fn queue_counter(queue: &str) -> Self {
        Self::new(RUNNING_COUNTS_PARTITION, queue)
    }

    /// Whether this key lives in the delayed-jobs partition.
    pub fn is_delayed_job(&self) -> bool {
        self.pk == DELAYED_JOBS_PARTITION
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pk, self.sk)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stored Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A record as held by the job store.
///
/// `expires_at` mirrors the TTL attribute: when set, the store evicts the
/// record autonomously some bounded time after the instant passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Primary key
    pub key: RecordKey,

    /// Attribute map (the record body)
    pub attributes: Map<String, Value>,

    /// Expiry instant, present only on delayed-job records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    /// Build a delayed-job record: `("job:delayed", job.id)` with the whole
    /// payload under `job` and the expiry epoch under `delay`.
    pub fn delayed_job(job: &JobPayload, expires_at: DateTime<Utc>) -> Result<Self> {
        let mut attributes = Map::new();
        attributes.insert(JOB_ATTRIBUTE.to_string(), job.to_value()?);
        attributes.insert(
            TTL_ATTRIBUTE.to_string(),
            Value::from(expires_at.timestamp()),
        );

        Ok(Self {
            key: RecordKey::delayed_job(&job.id),
            attributes,
            expires_at: Some(expires_at),
        })
    }

    /// Build a running-job record: `(queue, job.id)` with the payload under
    /// `job` and `status: "running"`. Never expires; overwritten if the same
    /// job id is executed again.
    pub fn running_job(job: &JobPayload) -> Result<Self> {
        let mut attributes = Map::new();
        attributes.insert(JOB_ATTRIBUTE.to_string(), job.to_value()?);
        attributes.insert(
            STATUS_ATTRIBUTE.to_string(),
            serde_json::to_value(JobStatus::Running)?,
        );

        Ok(Self {
            key: RecordKey::running_job(&job.queue, &job.id),
            attributes,
            expires_at: None,
        })
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Whether the record carries a non-null TTL attribute.
    pub fn has_ttl_attribute(&self) -> bool {
        matches!(self.attribute(TTL_ATTRIBUTE), Some(v) if !v.is_null())
    }

    /// Whether the record's expiry has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Extract and decode the embedded job payload.
    ///
    /// # Errors
    ///
    /// `MalformedJob` when the `job` attribute is absent or structurally
    /// invalid.
    pub fn job_payload(&self) -> Result<JobPayload> {
        let value = self
            .attribute(JOB_ATTRIBUTE)
            .cloned()
            .ok_or_else(|| {
                ManovaleError::new(
                    ErrorCode::MalformedJob,
                    "Record does not carry a job payload",
                )
            })?;
        JobPayload::from_value(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> JobPayload {
        JobPayload::new("j1", "q1").with_field("note", "hello")
    }

    #[test]
    fn test_delayed_record_shape() {
        let expiry = Utc::now() + chrono::Duration::seconds(60);
        let record = StoredRecord::delayed_job(&test_job(), expiry).unwrap();

        assert_eq!(record.key.pk, DELAYED_JOBS_PARTITION);
        assert_eq!(record.key.sk, "j1");
        assert!(record.key.is_delayed_job());
        assert!(record.has_ttl_attribute());
        assert_eq!(
            record.attribute(TTL_ATTRIBUTE),
            Some(&Value::from(expiry.timestamp()))
        );
        assert_eq!(record.expires_at, Some(expiry));
    }

    #[test]
    fn test_running_record_shape() {
        let record = StoredRecord::running_job(&test_job()).unwrap();

        assert_eq!(record.key.pk, "q1");
        assert_eq!(record.key.sk, "j1");
        assert!(!record.key.is_delayed_job());
        assert!(!record.has_ttl_attribute());
        assert_eq!(record.expires_at, None);
        assert_eq!(
            record.attribute(STATUS_ATTRIBUTE),
            Some(&serde_json::json!("running"))
        );
    }

    #[test]
    fn test_job_payload_round_trip() {
        let expiry = Utc::now() + chrono::Duration::seconds(60);
        let record = StoredRecord::delayed_job(&test_job(), expiry).unwrap();

        let decoded = record.job_payload().unwrap();
        assert_eq!(decoded.id.as_str(), "j1");
        assert_eq!(decoded.queue, "q1");
        assert_eq!(decoded.extra.get("note"), Some(&serde_json::json!("hello")));
    }

    #[test]
    fn test_missing_job_attribute_is_malformed() {
        let record = StoredRecord {
            key: RecordKey::delayed_job(&JobId::new("j1")),
            attributes: Map::new(),
            expires_at: None,
        };
        let err = record.job_payload().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedJob);
    }

    #[test]
    fn test_counter_key() {
        let key = RecordKey::queue_counter("q1");
        assert_eq!(key.pk, RUNNING_COUNTS_PARTITION);
        assert_eq!(key.sk, "q1");
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        let record = StoredRecord::delayed_job(&test_job(), now - chrono::Duration::seconds(1))
            .unwrap();
        assert!(record.is_expired(now));

        let record = StoredRecord::delayed_job(&test_job(), now + chrono::Duration::seconds(60))
            .unwrap();
        assert!(!record.is_expired(now));
    }
}
