#![allow(clippy::result_large_err)]
//! # Manovale Core
//!
//! Delayed and immediate job dispatch engine.
//!
//! ## Architecture
//!
//! - **Job Store**: single keyed table with TTL eviction, an ordered change
//!   feed carrying pre-mutation images, and an atomic counter increment
//! - **Expiry Watcher**: reacts to TTL evictions on the feed and resumes
//!   the evicted jobs, with batch failure isolation, bisect-on-error
//!   retries and dead-letter routing
//! - **Submit Orchestrator**: parks delayed jobs as expiring records,
//!   forwards immediate jobs straight to execution
//! - **Execution Orchestrator**: marks jobs running and maintains the
//!   per-queue running counters
//! - **Telemetry**: structured logging and Prometheus metrics
//!
//! Jobs with a future delay sleep inside the store; the store's own eviction
//! wakes them. Everything downstream of that wake-up is at-least-once, so
//! execution is safe to invoke more than once per job id.

pub mod config;
pub mod dlq;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod watcher;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, ManovaleError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dlq::{DeadLetterChannel, DeadLetterRecord, InMemoryDeadLetter, RedisDeadLetter};
    pub use crate::error::{ErrorCode, ErrorContext, ManovaleError, Result};
    pub use crate::job::{JobDelay, JobId, JobPayload, JobStatus};
    pub use crate::orchestrator::{
        ExecuteJob, ExecutionOrchestrator, SubmitOrchestrator, SubmitOutcome,
    };
    pub use crate::retry::{BackoffStrategy, RetryPolicy};
    pub use crate::store::{
        ChangeEvent, ChangeKind, FeedSubscription, InMemoryStore, RecordKey, StoreBackend,
        StoreConfig, StoredRecord, SweeperHandle,
    };
    pub use crate::watcher::{ExpiryWatcher, WatcherConfig, WatcherHandle, WatcherStats};
}
