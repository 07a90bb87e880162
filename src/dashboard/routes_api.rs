//! Single-node relay calls.
//!
//! | Route | Node endpoint |
//! |-------|---------------|
//! | `GET /{node}/api/daemonstatus` | `daemonstatus.json` |
//! | `GET /{node}/api/listprojects` | `listprojects.json` |
//! | `GET /{node}/api/listversions?project=` | `listversions.json` |
//! | `GET /{node}/api/listspiders?project=[&version=]` | `listspiders.json` |
//! | `GET /{node}/api/listjobs?project=` | `listjobs.json` |
//! | `POST /{node}/api/stop/{project}/{job}` | `stop.json` |
//! | `POST /{node}/api/forcestop/{project}/{job}` | `stop.json`, twice |
//!
//! The envelope is returned as-is with `200 OK`; the caller reads the node
//! outcome from `kind`, `status_code` and `status`.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{ApiError, AppState};
use crate::node_client::{Envelope, NodeRequest, ResponseFormat};

#[derive(Deserialize)]
pub(super) struct RelayQuery {
    project: Option<String>,
    version: Option<String>,
    ui: Option<String>,
}

/// Node endpoint for a relay option, and whether it needs `project`.
fn endpoint(opt: &str) -> Option<(&'static str, bool)> {
    match opt {
        "daemonstatus" => Some(("daemonstatus.json", false)),
        "listprojects" => Some(("listprojects.json", false)),
        "listversions" => Some(("listversions.json", true)),
        "listspiders" => Some(("listspiders.json", true)),
        "listjobs" => Some(("listjobs.json", true)),
        _ => None,
    }
}

pub(super) async fn handler_relay(
    State(state): State<Arc<AppState>>,
    Path((node, opt)): Path<(usize, String)>,
    headers: HeaderMap,
    Query(q): Query<RelayQuery>,
) -> Result<Json<Envelope>, ApiError> {
    let ctx = state.request_context(node, &headers, q.ui.as_deref())?;
    let (path, needs_project) =
        endpoint(&opt).ok_or_else(|| ApiError::NotFound(format!("unknown api option '{}'", opt)))?;

    let mut req = NodeRequest::get(&ctx.node, path).timeout(state.settings.poll.request_timeout());
    match q.project.as_deref().filter(|p| !p.is_empty()) {
        Some(project) => req = req.query("project", project),
        None if needs_project => {
            return Err(ApiError::BadRequest(format!("{} requires a project", opt)));
        }
        None => {}
    }
    if opt == "listspiders" {
        if let Some(version) = q.version.as_deref().filter(|v| !v.is_empty()) {
            req = req.query("_version", version);
        }
    }

    Ok(Json(state.client.call(&req, ResponseFormat::Json).await))
}

pub(super) async fn handler_stop(
    State(state): State<Arc<AppState>>,
    Path((node, project, job)): Path<(usize, String, String)>,
    headers: HeaderMap,
) -> Result<Json<Envelope>, ApiError> {
    relay_stop(&state, node, &project, &job, false, &headers).await
}

pub(super) async fn handler_forcestop(
    State(state): State<Arc<AppState>>,
    Path((node, project, job)): Path<(usize, String, String)>,
    headers: HeaderMap,
) -> Result<Json<Envelope>, ApiError> {
    relay_stop(&state, node, &project, &job, true, &headers).await
}

async fn relay_stop(
    state: &AppState,
    node: usize,
    project: &str,
    job: &str,
    force: bool,
    headers: &HeaderMap,
) -> Result<Json<Envelope>, ApiError> {
    let ctx = state.request_context(node, headers, None)?;
    info!(node, project, job, force, "relaying stop");
    let env = state
        .client
        .stop_job(
            &ctx.node,
            project,
            job,
            force,
            state.settings.poll.request_timeout(),
        )
        .await;
    Ok(Json(env))
}
