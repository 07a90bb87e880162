//! # Aggregator — Cluster-Wide Fan-Out
//!
//! Fans one logical request out to a set of nodes and collects the envelopes
//! into a [`ClusterSnapshot`] aligned with the requested indices: position `i`
//! of the snapshot always belongs to `indices[i]`, whatever happened to the
//! individual calls.
//!
//! Every index is resolved before any request leaves the process, so an
//! out-of-range index aborts the whole operation with [`RegistryError`] and
//! nothing else does. Calls run in a `JoinSet` gated by a semaphore, so the
//! latency of a round is close to the slowest node rather than the sum, and
//! dropping the future (client gone, response deadline hit) aborts the calls
//! still in flight.
//!
//! The module also derives the dashboard's feature flags and metadata, which
//! are pure functions of configuration, scheduler status and (optionally) a
//! snapshot.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{JobsStyle, Settings};
use crate::node_client::{Envelope, NodeClient, NodeRequest, ResponseFormat};
use crate::registry::{NodeConfig, Registry, RegistryError};
use crate::scheduler::{SchedulerState, SchedulerStatus};

/// Envelopes in the same order as the indices they were requested for.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub struct ClusterSnapshot(Vec<Envelope>);

impl ClusterSnapshot {
    pub fn envelopes(&self) -> &[Envelope] {
        &self.0
    }

    pub fn into_envelopes(self) -> Vec<Envelope> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ok_count(&self) -> usize {
        self.0.iter().filter(|e| e.is_ok()).count()
    }

    pub fn failed_nodes(&self) -> Vec<usize> {
        self.0.iter().filter(|e| !e.is_ok()).map(|e| e.node).collect()
    }

    /// Sum of the `running` counters reported by healthy nodes.
    pub fn running_jobs(&self) -> u64 {
        self.0
            .iter()
            .filter(|e| e.is_ok())
            .filter_map(|e| e.field("running").and_then(serde_json::Value::as_u64))
            .sum()
    }
}

pub async fn aggregate<F>(
    registry: &Registry,
    client: &NodeClient,
    indices: &[usize],
    format: ResponseFormat,
    max_concurrency: usize,
    builder: F,
) -> Result<ClusterSnapshot, RegistryError>
where
    F: Fn(&NodeConfig) -> NodeRequest,
{
    let requests = indices
        .iter()
        .map(|&i| registry.resolve(i).map(&builder))
        .collect::<Result<Vec<_>, _>>()?;
    if requests.is_empty() {
        return Ok(ClusterSnapshot(Vec::new()));
    }

    let permits = max_concurrency.clamp(1, requests.len());
    let semaphore = Arc::new(Semaphore::new(permits));
    // Dropping the set aborts the calls still in flight.
    let mut set = JoinSet::new();
    for (pos, req) in requests.iter().enumerate() {
        let client = client.clone();
        let req = req.clone();
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (pos, client.call(&req, format).await)
        });
    }

    let mut slots: Vec<Option<Envelope>> = vec![None; requests.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((pos, env)) => slots[pos] = Some(env),
            Err(e) => tracing::error!(error = %e, "aggregation task failed"),
        }
    }
    let envelopes: Vec<Envelope> = slots
        .into_iter()
        .zip(&requests)
        .map(|(slot, req)| {
            slot.unwrap_or_else(|| Envelope::transport_failure(req, "aggregation task failed"))
        })
        .collect();
    tracing::debug!(
        nodes = envelopes.len(),
        ok = envelopes.iter().filter(|e| e.is_ok()).count(),
        "aggregated cluster snapshot"
    );
    Ok(ClusterSnapshot(envelopes))
}

/// `daemonstatus.json` from every node in `indices`.
pub async fn daemon_status(
    registry: &Registry,
    client: &NodeClient,
    indices: &[usize],
    timeout: Duration,
    max_concurrency: usize,
) -> Result<ClusterSnapshot, RegistryError> {
    aggregate(
        registry,
        client,
        indices,
        ResponseFormat::Json,
        max_concurrency,
        |node| NodeRequest::get(node, "daemonstatus.json").timeout(timeout),
    )
    .await
}

// ── Feature flags ───────────────────────────────────────────────

pub struct FeatureInputs<'a> {
    pub settings: &'a Settings,
    pub registry: &'a Registry,
    /// `?ui=mobile` was requested.
    pub ui_mobile: bool,
    /// The user agent looks like a phone or tablet.
    pub client_mobile: bool,
    pub scheduler: &'a SchedulerStatus,
    pub snapshot: Option<&'a ClusterSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Features {
    /// Compact flag string, one position per feature.
    pub flags: String,
    pub any_node_requires_auth: bool,
    pub any_task_running: bool,
    pub running_jobs: Option<u64>,
}

/// Flag positions: auth `A`, jobs style `D`atabase/`C`ache, custom projects
/// dir `d`, polling `E`, log parser `L`, mobile UI `M`, mobile client `P`,
/// https `S`, then scheduler `-` paused / `T` armed / `t` idle. `-` marks an
/// off switch.
pub fn derive_features(inputs: &FeatureInputs<'_>) -> Features {
    let s = inputs.settings;
    let flag = |on: bool, c: char| if on { c } else { '-' };

    let mut flags = String::with_capacity(9);
    flags.push(flag(s.dashboard.enable_auth, 'A'));
    flags.push(match s.dashboard.jobs_style {
        JobsStyle::Database => 'D',
        JobsStyle::Cache => 'C',
    });
    flags.push(flag(!s.dashboard.projects_dir.is_empty(), 'd'));
    flags.push(flag(s.poll.enable, 'E'));
    flags.push(flag(s.logparser.enable, 'L'));
    flags.push(flag(inputs.ui_mobile, 'M'));
    flags.push(flag(inputs.client_mobile, 'P'));
    flags.push(flag(s.dashboard.enable_https, 'S'));
    flags.push(match inputs.scheduler.state {
        SchedulerState::Paused => '-',
        _ if inputs.scheduler.next_run.is_some() => 'T',
        _ => 't',
    });

    Features {
        flags,
        any_node_requires_auth: inputs.registry.any_requires_auth(),
        any_task_running: inputs.scheduler.state == SchedulerState::Running
            && inputs.scheduler.active_tasks > 0,
        running_jobs: inputs.snapshot.map(ClusterSnapshot::running_jobs),
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Metadata {
    pub version: &'static str,
    pub node_count: usize,
    pub groups: Vec<String>,
    pub jobs_style: &'static str,
    pub logparser: bool,
    pub poll_enabled: bool,
    pub scheduler: SchedulerStatus,
    pub features: Features,
}

pub fn metadata(inputs: &FeatureInputs<'_>) -> Metadata {
    let mut groups: Vec<String> = inputs
        .registry
        .nodes()
        .iter()
        .map(|n| n.group.clone())
        .filter(|g| !g.is_empty())
        .collect();
    groups.sort();
    groups.dedup();

    Metadata {
        version: env!("CARGO_PKG_VERSION"),
        node_count: inputs.registry.len(),
        groups,
        jobs_style: match inputs.settings.dashboard.jobs_style {
            JobsStyle::Database => "database",
            JobsStyle::Cache => "cache",
        },
        logparser: inputs.settings.logparser.enable,
        poll_enabled: inputs.settings.poll.enable,
        scheduler: inputs.scheduler.clone(),
        features: derive_features(inputs),
    }
}
