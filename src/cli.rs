//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Each function owns
//! a tokio runtime for the duration of its subcommand.

use anyhow::{Context, Result};
use crawldeck::config::Settings;
use crawldeck::events::EventBus;
use crawldeck::node_client::NodeClient;
use crawldeck::scheduler::{Scheduler, SchedulerConfig};
use crawldeck::{aggregator, context, dashboard, logstats};
use std::sync::Arc;
use tracing::info;

pub fn run_dashboard(mut settings: Settings, bind: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(bind) = bind {
        settings.dashboard.bind = bind;
    }
    if let Some(port) = port {
        settings.dashboard.port = port;
    }
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(dashboard::run(settings))
}

/// One-shot `daemonstatus.json` over the selected nodes. Unreachable nodes
/// show up as failed envelopes; only a bad selection is an error.
pub fn run_status(settings: &Settings, nodes: Option<&str>) -> Result<()> {
    let registry = settings.registry();
    let indices = context::parse_node_list(nodes, &registry)?;
    let client = NodeClient::new().context("failed to build HTTP client")?;

    let rt = tokio::runtime::Runtime::new()?;
    let snapshot = rt.block_on(aggregator::daemon_status(
        &registry,
        &client,
        &indices,
        settings.poll.request_timeout(),
        settings.poll.max_concurrency,
    ))?;
    info!(
        nodes = snapshot.len(),
        ok = snapshot.ok_count(),
        failed = ?snapshot.failed_nodes(),
        "status collected"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Run exactly one monitoring round and print the report. The round's
/// notifications are printed too, since nothing else will read them.
pub fn run_poll(settings: &Settings) -> Result<()> {
    let registry = Arc::new(settings.registry());
    let client = NodeClient::new().context("failed to build HTTP client")?;
    let events = Arc::new(EventBus::new());
    let config = SchedulerConfig::from_settings(settings, &registry);

    let mut builder = Scheduler::builder(Arc::clone(&registry), client.clone(), Arc::clone(&events), config);
    if let Some(logs) = logstats::from_settings(settings, &client) {
        builder = builder.log_source(logs);
    }
    let scheduler = builder.build();

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(scheduler.run_round());
    let output = serde_json::json!({
        "report": report,
        "notifications": events.recent_notifications(usize::MAX),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
