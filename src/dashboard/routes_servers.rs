//! Cluster overview: `daemonstatus.json` aggregated over a node selection.
//!
//! `GET` takes the selection from `?nodes=1,3` (all nodes when absent);
//! `POST` takes it from checked form fields named after node indices. An
//! empty form selection falls back to the node in the path.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ApiError, AppState};
use crate::aggregator::{self, ClusterSnapshot, FeatureInputs, Features};
use crate::context::{self, RequestContext};

#[derive(Deserialize)]
pub(super) struct ServersQuery {
    nodes: Option<String>,
    ui: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ServersData {
    context: RequestContext,
    selected: Vec<usize>,
    ok: usize,
    failed: Vec<usize>,
    features: Features,
    snapshot: ClusterSnapshot,
}

pub(super) async fn handler_servers(
    State(state): State<Arc<AppState>>,
    Path(node): Path<usize>,
    headers: HeaderMap,
    Query(q): Query<ServersQuery>,
) -> Result<Json<ServersData>, ApiError> {
    let ctx = state.request_context(node, &headers, q.ui.as_deref())?;
    let selected = context::parse_node_list(q.nodes.as_deref(), &state.registry)?;
    Ok(Json(collect(&state, ctx, selected).await?))
}

pub(super) async fn handler_servers_form(
    State(state): State<Arc<AppState>>,
    Path(node): Path<usize>,
    headers: HeaderMap,
    Query(q): Query<ServersQuery>,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Json<ServersData>, ApiError> {
    let ctx = state.request_context(node, &headers, q.ui.as_deref())?;
    let mut selected = context::selected_nodes(
        form.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &state.registry,
    )?;
    if selected.is_empty() {
        selected.push(ctx.node.index);
    }
    Ok(Json(collect(&state, ctx, selected).await?))
}

async fn collect(
    state: &AppState,
    ctx: RequestContext,
    selected: Vec<usize>,
) -> Result<ServersData, ApiError> {
    let snapshot = aggregator::daemon_status(
        &state.registry,
        &state.client,
        &selected,
        state.settings.poll.request_timeout(),
        state.settings.poll.max_concurrency,
    )
    .await?;
    let scheduler = state.scheduler.status();
    let features = aggregator::derive_features(&FeatureInputs {
        settings: &state.settings,
        registry: &state.registry,
        ui_mobile: ctx.ui_mobile,
        client_mobile: ctx.client.mobile,
        scheduler: &scheduler,
        snapshot: Some(&snapshot),
    });
    Ok(ServersData {
        context: ctx,
        selected,
        ok: snapshot.ok_count(),
        failed: snapshot.failed_nodes(),
        features,
        snapshot,
    })
}
