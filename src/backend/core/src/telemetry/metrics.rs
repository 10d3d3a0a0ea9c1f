//! Prometheus metrics for the dispatch pipeline.
//!
//! Counters are recorded inline at the call sites throughout the crate;
//! this module installs the recorder and registers descriptions so the
//! rendered exposition is self-documenting.

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Prometheus exposition endpoint (e.g. "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: default_metrics_endpoint(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

/// Handle on the installed metrics recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry {
            prometheus_handle: None,
        });
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    describe_counter!(
        "manovale_jobs_submitted_total",
        "Jobs accepted by the submit orchestrator, labeled by path"
    );
    describe_counter!(
        "manovale_jobs_executed_total",
        "Jobs marked running, labeled by queue"
    );
    describe_counter!(
        "manovale_execution_retries_total",
        "Immediate-path execution retries"
    );
    describe_counter!(
        "manovale_store_puts_total",
        "Records written to the job store"
    );
    describe_counter!(
        "manovale_store_increments_total",
        "Atomic counter increments applied by the job store"
    );
    describe_counter!(
        "manovale_store_evictions_total",
        "Expired records evicted by the TTL sweeper"
    );
    describe_counter!(
        "manovale_feed_events_total",
        "Change-feed events emitted, labeled by kind"
    );
    describe_counter!(
        "manovale_watcher_dispatched_total",
        "Expired jobs handed to execution by the watcher"
    );
    describe_counter!(
        "manovale_watcher_skipped_total",
        "Feed events skipped by the expiry filter"
    );
    describe_counter!(
        "manovale_watcher_retries_total",
        "Watcher retry rounds over failing batch elements"
    );
    describe_counter!(
        "manovale_dead_letters_total",
        "Records parked on the dead-letter channel, labeled by channel"
    );
    describe_counter!(
        "manovale_errors_total",
        "Errors constructed, labeled by code, category, severity and retryability"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.endpoint, "0.0.0.0:9090");
    }

    #[test]
    fn test_disabled_metrics_render_empty() {
        let registry = init_metrics(
            &MetricsConfig {
                enabled: false,
                ..Default::default()
            },
            "manovale-test",
        )
        .unwrap();
        assert_eq!(registry.render(), "");
    }
}
