//! Expiry Watcher: resumes delayed jobs when the store evicts them.
//!
//! The watcher subscribes to the store's change feed and reacts to exactly
//! one event shape: a removal in the `job:delayed` partition whose old image
//! carries a non-null `delay` attribute — i.e. a TTL eviction. The embedded
//! job payload is extracted from the pre-removal image and handed to the
//! execution entry point.
//!
//! Delivery is batched and at-least-once. Batch elements fail independently:
//! one malformed or perpetually failing element never blocks its siblings.
//! Failing elements are retried in bisected halves up to a bounded attempt
//! count, then routed to the dead-letter channel. Nothing is silently
//! dropped.

use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::dlq::{DeadLetterChannel, DeadLetterRecord};
use crate::error::{ErrorCode, ManovaleError};
use crate::job::JobPayload;
use crate::orchestrator::ExecuteJob;
use crate::retry::BackoffStrategy;
use crate::store::{ChangeEvent, FeedSubscription};

// ═══════════════════════════════════════════════════════════════════════════════
// Watcher Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the Expiry Watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Maximum events per delivery batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long to linger filling a batch after its first event arrives
    #[serde(with = "humantime_serde", default = "default_batch_wait")]
    pub batch_wait: Duration,

    /// Delivery attempts per element before dead-lettering
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Whether failing portions of a batch are retried in bisected halves
    #[serde(default = "default_bisect_on_error")]
    pub bisect_on_error: bool,

    /// Per-element execution timeout; a stalled invocation is a failure
    #[serde(with = "humantime_serde", default = "default_execution_timeout")]
    pub execution_timeout: Duration,

    /// Backoff between retry rounds
    #[serde(default)]
    pub retry_backoff: BackoffStrategy,

    /// Watcher name/identifier
    #[serde(default = "default_watcher_name")]
    pub name: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_wait: default_batch_wait(),
            retry_attempts: default_retry_attempts(),
            bisect_on_error: default_bisect_on_error(),
            execution_timeout: default_execution_timeout(),
            retry_backoff: BackoffStrategy::default(),
            name: default_watcher_name(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_wait() -> Duration {
    Duration::from_millis(200)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_bisect_on_error() -> bool {
    true
}

fn default_execution_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_watcher_name() -> String {
    "manovale-watcher".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Watcher Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Statistics for the Expiry Watcher.
#[derive(Debug, Clone, Default)]
pub struct WatcherStats {
    /// Events handed to execution successfully
    pub dispatched: Arc<AtomicU64>,
    /// Events skipped by the expiry filter
    pub skipped: Arc<AtomicU64>,
    /// Events whose payload failed to decode
    pub malformed: Arc<AtomicU64>,
    /// Events routed to the dead-letter channel
    pub dead_lettered: Arc<AtomicU64>,
    /// Retry rounds performed
    pub retries: Arc<AtomicU64>,
}

impl WatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Watcher Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a running watcher.
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    stats: WatcherStats,
    handle: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    /// Signal the watcher to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get watcher statistics.
    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    /// Signal shutdown and wait for the watcher task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Expiry Watcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Watches the change feed for TTL evictions and resumes the evicted jobs.
pub struct ExpiryWatcher {
    executor: Arc<dyn ExecuteJob>,
    dead_letter: Arc<dyn DeadLetterChannel>,
    config: WatcherConfig,
    stats: WatcherStats,
}

impl ExpiryWatcher {
    /// Create a new watcher.
    pub fn new(
        executor: Arc<dyn ExecuteJob>,
        dead_letter: Arc<dyn DeadLetterChannel>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            executor,
            dead_letter,
            config,
            stats: WatcherStats::new(),
        }
    }

    /// Start consuming `feed`, returning a handle for control.
    pub fn start(self, mut feed: FeedSubscription) -> WatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let name = self.config.name.clone();

        let handle = tokio::spawn(async move {
            info!(
                watcher = %name,
                batch_size = self.config.batch_size,
                retry_attempts = self.config.retry_attempts,
                "Expiry watcher started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(watcher = %name, "Expiry watcher shutting down");
                            break;
                        }
                    }
                    maybe = feed.recv() => match maybe {
                        None => {
                            warn!(watcher = %name, "Change feed closed, watcher stopping");
                            break;
                        }
                        Some(first) => {
                            let batch = Self::fill_batch(&mut feed, first, &self.config).await;
                            self.process_batch(batch).await;
                        }
                    }
                }
            }

            info!(watcher = %name, "Expiry watcher stopped");
        });

        WatcherHandle {
            shutdown: shutdown_tx,
            stats,
            handle,
        }
    }

    /// Collect up to `batch_size` events, lingering at most `batch_wait`
    /// after the first.
    async fn fill_batch(
        feed: &mut FeedSubscription,
        first: ChangeEvent,
        config: &WatcherConfig,
    ) -> Vec<ChangeEvent> {
        let mut batch = vec![first];
        let deadline = Instant::now() + config.batch_wait;

        while batch.len() < config.batch_size {
            match timeout_at(deadline, feed.recv()).await {
                Ok(Some(event)) => batch.push(event),
                _ => break,
            }
        }
        batch
    }

    /// Process one delivery batch: filter, decode, dispatch.
    async fn process_batch(&self, events: Vec<ChangeEvent>) {
        let mut accepted = Vec::new();

        for event in events {
            if !event.is_expiry_removal() {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                counter!("manovale_watcher_skipped_total").increment(1);
                debug!(
                    sequence = event.sequence,
                    kind = %event.kind,
                    key = %event.key,
                    "Event skipped by expiry filter"
                );
                continue;
            }

            let Some(image) = event.old_image.as_ref() else {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match image.job_payload() {
                Ok(job) => accepted.push((event, job)),
                Err(e) => {
                    // Structural: never retried, parked immediately.
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    self.dead_letter_event(&event, &e, 1).await;
                }
            }
        }

        if !accepted.is_empty() {
            self.dispatch_accepted(accepted).await;
        }
    }

    /// Dispatch accepted elements with failure isolation and bisect retries.
    ///
    /// Elements of a chunk run concurrently. Survivable failures are split
    /// into halves and retried in isolation until the attempt bound, then
    /// dead-lettered.
    async fn dispatch_accepted(&self, elements: Vec<(ChangeEvent, JobPayload)>) {
        let mut work: VecDeque<(Vec<(ChangeEvent, JobPayload)>, u32)> = VecDeque::new();
        work.push_back((elements, 1));

        while let Some((chunk, attempt)) = work.pop_front() {
            if attempt > 1 {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                counter!("manovale_watcher_retries_total").increment(1);
                tokio::time::sleep(self.config.retry_backoff.delay_for_attempt(attempt - 2))
                    .await;
            }

            let execution_timeout = self.config.execution_timeout;
            let results = join_all(chunk.iter().map(|(event, job)| {
                let executor = Arc::clone(&self.executor);
                let job = job.clone();
                let sequence = event.sequence;
                async move {
                    let result =
                        match tokio::time::timeout(execution_timeout, executor.execute(job)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ManovaleError::new(
                                ErrorCode::DispatchTimeout,
                                "Execution did not complete within the invocation timeout",
                            )),
                        };
                    (sequence, result)
                }
            }))
            .await;

            let mut failed = Vec::new();
            for ((event, job), (_, result)) in chunk.into_iter().zip(results) {
                match result {
                    Ok(()) => {
                        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                        counter!("manovale_watcher_dispatched_total").increment(1);
                        debug!(
                            sequence = event.sequence,
                            job_id = %job.id,
                            queue = %job.queue,
                            attempt,
                            "Expired job handed to execution"
                        );
                    }
                    Err(e) if !e.is_retryable() => {
                        self.dead_letter_event(&event, &e, attempt).await;
                    }
                    Err(e) => failed.push(((event, job), e)),
                }
            }

            if failed.is_empty() {
                continue;
            }

            if attempt >= self.config.retry_attempts {
                for ((event, _), e) in failed {
                    self.dead_letter_event(&event, &e, attempt).await;
                }
                continue;
            }

            warn!(
                failed = failed.len(),
                attempt,
                retry_attempts = self.config.retry_attempts,
                "Batch elements failed, retrying in isolation"
            );
            let mut items: Vec<_> = failed.into_iter().map(|(pair, _)| pair).collect();
            if self.config.bisect_on_error && items.len() > 1 {
                let right = items.split_off(items.len() / 2);
                work.push_back((items, attempt + 1));
                work.push_back((right, attempt + 1));
            } else {
                work.push_back((items, attempt + 1));
            }
        }
    }

    /// Park an event on the dead-letter channel.
    async fn dead_letter_event(&self, event: &ChangeEvent, cause: &ManovaleError, attempts: u32) {
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);

        let payload = serde_json::to_value(event).unwrap_or_else(|_| {
            serde_json::json!({"sequence": event.sequence, "key": event.key.to_string()})
        });
        let record = DeadLetterRecord::new(payload, cause.user_message(), cause.code(), attempts);

        warn!(
            sequence = event.sequence,
            key = %event.key,
            error_code = %cause.code(),
            attempts,
            "Routing event to dead-letter channel"
        );

        if let Err(publish_error) = self.dead_letter.publish(record).await {
            // The event is lost to inspection if this happens; log loudly.
            error!(
                sequence = event.sequence,
                key = %event.key,
                error = %publish_error,
                "Failed to publish to the dead-letter channel"
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
