//! Change-feed event model.
//!
//! The store publishes a totally ordered stream of mutation events. Each
//! event carries the record's state immediately before the mutation (the
//! old image), which is all downstream consumers need: the Expiry Watcher
//! reacts to removals of expired delayed-job records and reads the job
//! payload out of the pre-removal image.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use super::record::{RecordKey, StoredRecord};

// ═══════════════════════════════════════════════════════════════════════════════
// Change Kind
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// A record was created
    Insert,
    /// An existing record was overwritten or mutated in place
    Modify,
    /// A record was removed (application delete or TTL eviction)
    Remove,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Remove => write!(f, "REMOVE"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Change Event
// ═══════════════════════════════════════════════════════════════════════════════

/// A single mutation event on the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Monotonic position in the feed
    pub sequence: u64,

    /// Mutation kind
    pub kind: ChangeKind,

    /// Key of the mutated record
    pub key: RecordKey,

    /// Record state immediately before the mutation (absent on inserts)
    pub old_image: Option<StoredRecord>,

    /// When the mutation was applied
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Whether this event is a removal of an expiring delayed-job record:
    /// a `REMOVE` in the `job:delayed` partition whose old image carries a
    /// non-null `delay` attribute. This is the only event shape the Expiry
    /// Watcher acts on.
    pub fn is_expiry_removal(&self) -> bool {
        self.kind == ChangeKind::Remove
            && self.key.is_delayed_job()
            && self
                .old_image
                .as_ref()
                .is_some_and(|image| image.has_ttl_attribute())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Feed Subscription
// ═══════════════════════════════════════════════════════════════════════════════

/// A consumer's handle on the change feed.
///
/// Events arrive in feed order and are buffered without bound, so a slow
/// consumer lags but never loses events. Delivery starts at subscription
/// time; there is no replay of earlier history.
pub struct FeedSubscription {
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl FeedSubscription {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next event, or `None` once the store is dropped.
    ///
    /// Cancel-safe: an event is either returned or still queued.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Receive without waiting; `None` when no event is queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
