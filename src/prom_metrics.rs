//! # Prometheus Metrics — Exposition for Scraping
//!
//! Exposes crawldeck operational metrics in the Prometheus text exposition
//! format.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `crawldeck_node_requests_total` | Counter | `node`, `outcome` | Node calls by envelope kind |
//! | `crawldeck_poll_ticks_total` | Counter | — | Completed polling rounds |
//! | `crawldeck_notifications_total` | Counter | `trigger` | Notifications handed to the notifier |
//! | `crawldeck_monitored_tasks` | Gauge | — | Active monitoring tasks |
//! | `crawldeck_scheduler_running` | Gauge | — | 1 while the scheduler is running |
//! | `crawldeck_http_request_duration_seconds` | Histogram | `method`, `path` | Dashboard request latency |
//!
//! The `/metrics` endpoint renders the current registry state on each scrape.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct NodeLabel {
    pub node: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct TriggerLabel {
    pub trigger: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

fn http_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.005, 2.0, 12))
}

/// Thread-safe metrics registry. All fields are atomic and can be updated
/// from request handlers and the scheduler loop alike.
pub struct Metrics {
    pub registry: Registry,
    pub node_requests: Family<NodeLabel, Counter>,
    pub poll_ticks: Counter,
    pub notifications: Family<TriggerLabel, Counter>,
    pub monitored_tasks: Gauge,
    pub scheduler_running: Gauge,
    pub http_request_duration: Family<HttpLabel, Histogram, fn() -> Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let node_requests = Family::<NodeLabel, Counter>::default();
        registry.register(
            "crawldeck_node_requests",
            "Node API calls by node and outcome",
            node_requests.clone(),
        );

        let poll_ticks = Counter::default();
        registry.register(
            "crawldeck_poll_ticks",
            "Completed polling rounds",
            poll_ticks.clone(),
        );

        let notifications = Family::<TriggerLabel, Counter>::default();
        registry.register(
            "crawldeck_notifications",
            "Notifications sent by trigger",
            notifications.clone(),
        );

        let monitored_tasks = Gauge::default();
        registry.register(
            "crawldeck_monitored_tasks",
            "Number of active monitoring tasks",
            monitored_tasks.clone(),
        );

        let scheduler_running = Gauge::default();
        registry.register(
            "crawldeck_scheduler_running",
            "1 while the polling scheduler is running, 0 otherwise",
            scheduler_running.clone(),
        );

        let http_request_duration =
            Family::<HttpLabel, Histogram, fn() -> Histogram>::new_with_constructor(
                http_histogram as fn() -> Histogram,
            );
        registry.register(
            "crawldeck_http_request_duration_seconds",
            "Dashboard HTTP request latency",
            http_request_duration.clone(),
        );

        Self {
            registry,
            node_requests,
            poll_ticks,
            notifications,
            monitored_tasks,
            scheduler_running,
            http_request_duration,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_returns_valid_text() {
        let m = Metrics::new();
        m.monitored_tasks.set(3);
        m.scheduler_running.set(1);
        m.node_requests
            .get_or_create(&NodeLabel {
                node: "2".to_string(),
                outcome: "transport_error".to_string(),
            })
            .inc();

        let output = m.encode();
        assert!(output.contains("crawldeck_monitored_tasks"));
        assert!(output.contains("crawldeck_scheduler_running"));
        assert!(output.contains("crawldeck_node_requests"));
        assert!(output.contains("transport_error"));
    }

    #[test]
    fn metrics_per_trigger_counters_independent() {
        let m = Metrics::new();
        m.notifications
            .get_or_create(&TriggerLabel {
                trigger: "ERROR".to_string(),
            })
            .inc_by(2);
        m.notifications
            .get_or_create(&TriggerLabel {
                trigger: "CRITICAL".to_string(),
            })
            .inc();

        let output = m.encode();
        assert!(output.contains("ERROR"));
        assert!(output.contains("CRITICAL"));
    }

    #[test]
    fn http_histogram_records_observations() {
        let m = Metrics::new();
        m.http_request_duration
            .get_or_create(&HttpLabel {
                method: "GET".into(),
                path: "/:id/servers".into(),
            })
            .observe(0.02);
        let output = m.encode();
        assert!(output.contains("crawldeck_http_request_duration_seconds"));
        assert!(output.contains("/:id/servers"));
    }
}
