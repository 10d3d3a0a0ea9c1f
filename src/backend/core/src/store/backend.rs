//! Store backend implementations.
//!
//! The job store is a single keyed table with three obligations beyond plain
//! puts: autonomous TTL eviction of expiring records, an ordered change feed
//! carrying pre-mutation images, and an atomic numeric increment.
//!
//! `InMemoryStore` is the in-process implementation. All mutations and feed
//! emission happen under one async mutex, which gives the feed its total
//! order and makes `increment` a single indivisible read-modify-write — the
//! one operation that must never be a client-side read-then-write.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use super::feed::{ChangeEvent, ChangeKind, FeedSubscription};
use super::record::{RecordKey, StoredRecord, TOTAL_COUNT_FIELD};
use crate::error::{ErrorCode, ManovaleError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Store Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Logical table name (labels logs and metrics)
    #[serde(default = "default_table")]
    pub table: String,

    /// How often the sweeper looks for expired records. Eviction happens at
    /// an unspecified but bounded delay after expiry, never at the exact
    /// instant.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_table() -> String {
    "Manovale".to_string()
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Contract of the job store.
///
/// Writes are independent upserts with last-writer-wins semantics; the only
/// cross-caller atomicity point is `increment`.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Store a record keyed by `(pk, sk)`, overwriting any existing record
    /// with the same key.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on backend outage.
    async fn put(&self, record: StoredRecord) -> Result<()>;

    /// Atomically add `amount` to a numeric field, creating the record with
    /// `amount` as the initial value if absent. Returns the new value.
    ///
    /// Safe under unbounded concurrent callers.
    async fn increment(&self, key: RecordKey, field: &str, amount: i64) -> Result<i64>;

    /// Subscribe to the change feed. Events are delivered in mutation order
    /// starting from the moment of subscription.
    async fn subscribe(&self) -> FeedSubscription;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

struct TableState {
    records: HashMap<RecordKey, StoredRecord>,
    subscribers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    sequence: u64,
}

/// In-process job store.
pub struct InMemoryStore {
    config: StoreConfig,
    state: Mutex<TableState>,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TableState {
                records: HashMap::new(),
                subscribers: Vec::new(),
                sequence: 0,
            }),
        }
    }

    /// Emit a change event to all live subscribers, in mutation order.
    fn emit(
        state: &mut TableState,
        kind: ChangeKind,
        key: RecordKey,
        old_image: Option<StoredRecord>,
    ) {
        state.sequence += 1;
        let event = ChangeEvent {
            sequence: state.sequence,
            kind,
            key,
            old_image,
            occurred_at: Utc::now(),
        };
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        counter!("manovale_feed_events_total", "kind" => kind.to_string()).increment(1);
    }

    /// Remove every record whose expiry has passed, emitting a `REMOVE`
    /// event with the pre-removal image for each. Returns the eviction
    /// count.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired: Vec<RecordKey> = state
            .records
            .values()
            .filter(|record| record.is_expired(now))
            .map(|record| record.key.clone())
            .collect();

        let evicted = expired.len();
        for key in expired {
            if let Some(old) = state.records.remove(&key) {
                debug!(table = %self.config.table, key = %key, "Evicting expired record");
                Self::emit(&mut state, ChangeKind::Remove, key, Some(old));
            }
        }

        if evicted > 0 {
            counter!("manovale_store_evictions_total", "table" => self.config.table.clone())
                .increment(evicted as u64);
            debug!(table = %self.config.table, evicted, "TTL sweep complete");
        }

        evicted
    }

    /// Start the background TTL sweeper, returning a handle for control.
    pub fn start_sweeper(self: Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = self;
        let interval = store.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                table = %store.config.table,
                interval_secs = interval.as_secs_f64(),
                "TTL sweeper started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(table = %store.config.table, "TTL sweeper shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        store.sweep_expired().await;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection (not part of the core contract; consumers react to the
    // feed, these exist for tests and operational checks)
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch a record by key.
    pub async fn record(&self, key: &RecordKey) -> Option<StoredRecord> {
        self.state.lock().await.records.get(key).cloned()
    }

    /// Current value of a queue's running counter, if the counter exists.
    pub async fn counter_value(&self, queue: &str) -> Option<i64> {
        let key = RecordKey::queue_counter(queue);
        self.state
            .lock()
            .await
            .records
            .get(&key)
            .and_then(|record| record.attribute(TOTAL_COUNT_FIELD))
            .and_then(|value| value.as_i64())
    }

    /// Number of records currently stored.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Whether the table holds no records.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn put(&self, record: StoredRecord) -> Result<()> {
        let mut state = self.state.lock().await;

        let key = record.key.clone();
        let old = state.records.insert(key.clone(), record);
        let kind = if old.is_some() {
            ChangeKind::Modify
        } else {
            ChangeKind::Insert
        };

        debug!(table = %self.config.table, key = %key, kind = %kind, "Record stored");
        Self::emit(&mut state, kind, key, old);

        counter!("manovale_store_puts_total", "table" => self.config.table.clone()).increment(1);
        Ok(())
    }

    async fn increment(&self, key: RecordKey, field: &str, amount: i64) -> Result<i64> {
        let mut state = self.state.lock().await;

        let old = state.records.get(&key).cloned();
        let current = old
            .as_ref()
            .and_then(|record| record.attribute(field))
            .map(|value| {
                value.as_i64().ok_or_else(|| {
                    ManovaleError::with_internal(
                        ErrorCode::InvalidJson,
                        "Counter field is not numeric",
                        format!("key={key} field={field}"),
                    )
                })
            })
            .transpose()?
            .unwrap_or(0);
        let new_value = current + amount;

        let mut record = old.clone().unwrap_or_else(|| StoredRecord {
            key: key.clone(),
            attributes: serde_json::Map::new(),
            expires_at: None,
        });
        record
            .attributes
            .insert(field.to_string(), serde_json::Value::from(new_value));
        state.records.insert(key.clone(), record);

        let kind = if old.is_some() {
            ChangeKind::Modify
        } else {
            ChangeKind::Insert
        };
        debug!(
            table = %self.config.table,
            key = %key,
            field,
            amount,
            new_value,
            "Counter incremented"
        );
        Self::emit(&mut state, kind, key, old);

        counter!("manovale_store_increments_total", "table" => self.config.table.clone())
            .increment(1);
        Ok(new_value)
    }

    async fn subscribe(&self) -> FeedSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.subscribers.push(tx);
        FeedSubscription::new(rx)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sweeper Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling the background TTL sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the sweeper task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
