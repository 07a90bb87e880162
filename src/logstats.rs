//! # Log Stats — Per-Job Log Summaries
//!
//! The log-parsing subsystem runs next to each crawl node and publishes a
//! `stats.json` document. crawldeck treats it as a black box and only reads
//! the per-job severity counts and the finish reason out of it:
//!
//! ```text
//! datas.<project>.<spider>.<job>.log_categories.<key>_logs.count
//! datas.<project>.<spider>.<job>.finish_reason
//! ```
//!
//! [`LogSource`] is the seam the scheduler consumes. [`LogParserSource`]
//! fetches the document through the [`NodeClient`]; [`StaticLogSource`] serves
//! fixed summaries for tests and offline runs.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Settings;
use crate::evaluator::{LogCounts, TriggerKey};
use crate::monitor::JobKey;
use crate::node_client::{NodeClient, NodeRequest, ResponseFormat};
use crate::registry::NodeConfig;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LogSummary {
    pub counts: LogCounts,
    pub finish_reason: Option<String>,
    pub pages: Option<u64>,
    pub items: Option<u64>,
}

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn summary(&self, node: &NodeConfig, job: &JobKey) -> Option<LogSummary>;

    /// Summaries for several jobs on one node. Sources that serve a whole
    /// node document at once should override this.
    async fn summaries(
        &self,
        node: &NodeConfig,
        jobs: &[JobKey],
    ) -> HashMap<JobKey, LogSummary> {
        let mut out = HashMap::new();
        for job in jobs {
            if let Some(s) = self.summary(node, job).await {
                out.insert(job.clone(), s);
            }
        }
        out
    }
}

/// Extract one job's summary from a LogParser `stats.json` document.
pub fn parse_stats(doc: &Value, job: &JobKey) -> Option<LogSummary> {
    let entry = doc
        .get("datas")?
        .get(&job.project)?
        .get(&job.spider)?
        .get(&job.job)?;

    let mut counts = LogCounts::new();
    if let Some(categories) = entry.get("log_categories") {
        for key in TriggerKey::ALL {
            let count = categories
                .get(key.log_category())
                .and_then(|c| c.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            counts.set(key, count);
        }
    }

    Some(LogSummary {
        counts,
        finish_reason: entry
            .get("finish_reason")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty() && *s != "N/A")
            .map(str::to_string),
        pages: entry.get("pages").and_then(Value::as_u64),
        items: entry.get("items").and_then(Value::as_u64),
    })
}

pub struct LogParserSource {
    client: NodeClient,
    stats_path: String,
    timeout: Duration,
}

impl LogParserSource {
    pub fn new(client: NodeClient, stats_path: impl Into<String>, timeout: Duration) -> Self {
        LogParserSource {
            client,
            stats_path: stats_path.into(),
            timeout,
        }
    }

    async fn fetch(&self, node: &NodeConfig) -> Option<Value> {
        let req = NodeRequest::get(node, &self.stats_path).timeout(self.timeout);
        let env = self.client.call(&req, ResponseFormat::Json).await;
        if !env.is_ok() {
            tracing::warn!(
                node = node.index,
                kind = env.kind.label(),
                status_code = env.status_code,
                "log stats unavailable"
            );
            return None;
        }
        env.payload.as_json().cloned()
    }
}

/// The configured log source, or `None` when log parsing is disabled.
pub fn from_settings(settings: &Settings, client: &NodeClient) -> Option<Arc<dyn LogSource>> {
    if !settings.logparser.enable {
        return None;
    }
    Some(Arc::new(LogParserSource::new(
        client.clone(),
        settings.logparser.stats_path.clone(),
        settings.poll.request_timeout(),
    )))
}

#[async_trait]
impl LogSource for LogParserSource {
    async fn summary(&self, node: &NodeConfig, job: &JobKey) -> Option<LogSummary> {
        let doc = self.fetch(node).await?;
        parse_stats(&doc, job)
    }

    async fn summaries(
        &self,
        node: &NodeConfig,
        jobs: &[JobKey],
    ) -> HashMap<JobKey, LogSummary> {
        if jobs.is_empty() {
            return HashMap::new();
        }
        let Some(doc) = self.fetch(node).await else {
            return HashMap::new();
        };
        jobs.iter()
            .filter_map(|j| parse_stats(&doc, j).map(|s| (j.clone(), s)))
            .collect()
    }
}

/// In-memory summaries keyed by node index and job.
#[derive(Default)]
pub struct StaticLogSource {
    entries: Mutex<HashMap<(usize, JobKey), LogSummary>>,
}

impl StaticLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: usize, job: JobKey, summary: LogSummary) {
        crate::lock_or_recover(&self.entries).insert((node, job), summary);
    }
}

#[async_trait]
impl LogSource for StaticLogSource {
    async fn summary(&self, node: &NodeConfig, job: &JobKey) -> Option<LogSummary> {
        crate::lock_or_recover(&self.entries)
            .get(&(node.index, job.clone()))
            .cloned()
    }
}
