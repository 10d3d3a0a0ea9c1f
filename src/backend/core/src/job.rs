//! Job payload model and validation.
//!
//! A job is an opaque structured payload identified by `id` and `queue`,
//! optionally carrying a `delay`. Everything else the caller submits is kept
//! verbatim and travels with the job through the store and the dispatch
//! pipeline.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{ManovaleError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a submitted job.
///
/// Supplied by the caller; doubles as the sort key of the job's records in
/// the store, so it must be unique per submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Create a job ID from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random job ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Delay
// ═══════════════════════════════════════════════════════════════════════════════

/// Values at or above this are absolute unix epoch seconds; smaller values
/// are offsets in seconds from submission time.
const ABSOLUTE_EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// A caller-supplied delay, either relative or absolute.
///
/// Integer seconds: large values (on the order of a unix epoch timestamp)
/// are taken as absolute expiry times, small values as offsets from the
/// submission instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDelay(pub i64);

impl JobDelay {
    /// Create a delay of `secs` seconds from submission time.
    pub fn seconds(secs: i64) -> Self {
        Self(secs)
    }

    /// Create a delay expiring at an absolute instant.
    pub fn until(at: DateTime<Utc>) -> Self {
        Self(at.timestamp())
    }

    /// Whether this delay carries an absolute expiry timestamp.
    pub fn is_absolute(&self) -> bool {
        self.0 >= ABSOLUTE_EPOCH_THRESHOLD
    }

    /// Resolve the delay into an absolute expiry instant.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_absolute() {
            Utc.timestamp_opt(self.0, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        } else {
            now + chrono::Duration::seconds(self.0.max(0))
        }
    }
}

impl fmt::Display for JobDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Execution status recorded on a job's status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job has been handed to execution and is currently running
    Running,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// A submitted job.
///
/// `id` and `queue` are required; `delay` defers execution; all other fields
/// are opaque to the dispatch pipeline and preserved through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Unique job identifier
    pub id: JobId,

    /// Queue this job belongs to (shares a running-count aggregate)
    pub queue: String,

    /// Optional delay; present means the job is deferred until expiry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<JobDelay>,

    /// Opaque caller-supplied fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobPayload {
    /// Create a new immediate job.
    pub fn new(id: impl Into<JobId>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            delay: None,
            extra: Map::new(),
        }
    }

    /// Set the delay.
    pub fn with_delay(mut self, delay: JobDelay) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add an opaque field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Whether this job carries a delay.
    pub fn is_delayed(&self) -> bool {
        self.delay.is_some()
    }

    /// Validate required fields.
    ///
    /// # Errors
    ///
    /// Returns `MalformedJob` if `id` or `queue` is empty. Structural errors
    /// are fatal: they are never retried and route straight to dead-letter.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(ManovaleError::malformed_job("id", "Job is missing an id"));
        }
        if self.queue.trim().is_empty() {
            return Err(ManovaleError::malformed_job(
                "queue",
                "Job is missing a queue",
            ));
        }
        Ok(())
    }

    /// Decode a payload from a JSON value (e.g. the `job` attribute of a
    /// stored record).
    pub fn from_value(value: Value) -> Result<Self> {
        let job: JobPayload = serde_json::from_value(value).map_err(|e| {
            ManovaleError::with_internal(
                crate::error::ErrorCode::MalformedJob,
                "Job payload is structurally invalid",
                e.to_string(),
            )
        })?;
        job.validate()?;
        Ok(job)
    }

    /// Encode the payload as a JSON value.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
