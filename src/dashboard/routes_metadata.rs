//! Dashboard metadata: version, scheduler state, node count and the feature
//! string the front end keys its layout on.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::AppState;
use crate::aggregator::{self, FeatureInputs};
use crate::context::ClientKind;

#[derive(Deserialize)]
pub(super) struct MetadataQuery {
    ui: Option<String>,
}

pub(super) async fn handler_api_metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<MetadataQuery>,
) -> impl IntoResponse {
    let client = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(ClientKind::from_user_agent)
        .unwrap_or_default();
    let scheduler = state.scheduler.status();
    let metadata = aggregator::metadata(&FeatureInputs {
        settings: &state.settings,
        registry: &state.registry,
        ui_mobile: q.ui.as_deref() == Some("mobile"),
        client_mobile: client.mobile,
        scheduler: &scheduler,
        snapshot: None,
    });
    Json(metadata)
}
