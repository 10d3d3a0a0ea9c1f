//! The job store: a single keyed table with TTL eviction and a change feed.
//!
//! This module provides:
//!
//! - **Records**: the two-part-key record model and the three record kinds
//!   (delayed jobs, running jobs, queue counters)
//! - **Feed**: ordered change events carrying pre-mutation images
//! - **Backend**: the store contract plus the in-process implementation with
//!   its background TTL sweeper
//!
//! The store exclusively owns all persisted records. Consumers never query
//! it on the hot path; they react to the change feed.

pub mod backend;
pub mod feed;
pub mod record;

pub use backend::{InMemoryStore, StoreBackend, StoreConfig, SweeperHandle};
pub use feed::{ChangeEvent, ChangeKind, FeedSubscription};
pub use record::{
    RecordKey, StoredRecord, DELAYED_JOBS_PARTITION, JOB_ATTRIBUTE, RUNNING_COUNTS_PARTITION,
    STATUS_ATTRIBUTE, TOTAL_COUNT_FIELD, TTL_ATTRIBUTE,
};
