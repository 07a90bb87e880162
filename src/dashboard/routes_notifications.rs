//! Notification feed and scheduler activity log.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::AppState;

#[derive(Deserialize)]
pub(super) struct FeedQuery {
    limit: Option<usize>,
    /// Only notifications with a greater id.
    since: Option<u64>,
}

pub(super) async fn handler_api_notifications(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedQuery>,
) -> impl IntoResponse {
    let mut notifications = state.event_bus.recent_notifications(q.limit.unwrap_or(50));
    if let Some(since) = q.since {
        notifications.retain(|n| n.id > since);
    }
    Json(serde_json::json!({ "notifications": notifications }))
}

pub(super) async fn handler_api_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedQuery>,
) -> impl IntoResponse {
    let events = state.event_bus.recent_events(q.limit.unwrap_or(200));
    Json(serde_json::json!({ "events": events }))
}
