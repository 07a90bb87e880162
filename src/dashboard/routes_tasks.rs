//! Polling scheduler and monitoring task controls.
//!
//! `GET /{node}/tasks` returns the scheduler state, its registered jobs and
//! a copy of every monitoring task. Scheduler actions are `start`, `pause`
//! and `resume`; task actions are `pause`, `resume` and `stop`. A transition
//! that is not valid from the current state answers `409`, an unmonitored
//! target `404`.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use super::{ApiError, AppState};
use crate::monitor::TaskView;
use crate::scheduler::{ScheduledJob, SchedulerStatus};

#[derive(Serialize)]
pub(super) struct TasksData {
    scheduler: SchedulerStatus,
    jobs: Vec<ScheduledJob>,
    tasks: Vec<TaskView>,
}

pub(super) async fn handler_tasks(
    State(state): State<Arc<AppState>>,
    Path(node): Path<usize>,
    headers: HeaderMap,
) -> Result<Json<TasksData>, ApiError> {
    state.request_context(node, &headers, None)?;
    Ok(Json(TasksData {
        scheduler: state.scheduler.status(),
        jobs: state.scheduler.jobs(),
        tasks: state.scheduler.tasks(),
    }))
}

pub(super) async fn handler_scheduler_action(
    State(state): State<Arc<AppState>>,
    Path((node, action)): Path<(usize, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.request_context(node, &headers, None)?;
    match action.as_str() {
        "start" => state.scheduler.start()?,
        "pause" => state.scheduler.pause()?,
        "resume" => state.scheduler.resume()?,
        _ => {
            return Err(ApiError::NotFound(format!(
                "unknown scheduler action '{}'",
                action
            )))
        }
    }
    Ok(Json(serde_json::json!({
        "status": "ok",
        "scheduler": state.scheduler.status(),
    })))
}

pub(super) async fn handler_task_action(
    State(state): State<Arc<AppState>>,
    Path((node, target, action)): Path<(usize, usize, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.request_context(node, &headers, None)?;
    state.registry.resolve(target)?;
    match action.as_str() {
        "pause" => state.scheduler.pause_task(target)?,
        "resume" => state.scheduler.resume_task(target)?,
        "stop" => state.scheduler.stop_task(target)?,
        _ => {
            return Err(ApiError::NotFound(format!(
                "unknown task action '{}'",
                action
            )))
        }
    }
    Ok(Json(serde_json::json!({
        "status": "ok",
        "node": target,
        "action": action,
        "task": state.scheduler.task(target),
    })))
}
