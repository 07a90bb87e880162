//! # Dashboard — HTTP Surface over the Aggregation Core
//!
//! Runs an Axum HTTP server exposing the cluster snapshot, single-node relay
//! calls, scheduler controls and the notification feed as JSON. The polling
//! scheduler runs in the same process and is shut down after the server
//! drains.
//!
//! Every `/{node}/...` route validates its node index through
//! [`RequestContext`]; an out-of-range index is the only failure that turns
//! into a 400. Node-level failures travel inside the returned envelopes.

mod routes_api;
mod routes_health;
mod routes_metadata;
mod routes_notifications;
mod routes_servers;
mod routes_tasks;

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use crate::config::Settings;
use crate::context::{ContextError, RequestContext};
use crate::events::EventBus;
use crate::node_client::NodeClient;
use crate::registry::{Registry, RegistryError};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
use crate::{logstats, prom_metrics};

pub struct AppState {
    pub settings: Settings,
    pub registry: Arc<Registry>,
    pub client: NodeClient,
    pub scheduler: Scheduler,
    pub event_bus: Arc<EventBus>,
    pub prom_metrics: Arc<prom_metrics::Metrics>,
}

impl AppState {
    /// Wire the registry, node client, event bus and scheduler from
    /// settings. The scheduler is built stopped.
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        let prom_metrics = Arc::new(prom_metrics::Metrics::new());
        let registry = Arc::new(settings.registry());
        let client = NodeClient::new()
            .context("failed to build HTTP client")?
            .with_metrics(Arc::clone(&prom_metrics));
        let event_bus = Arc::new(EventBus::new());

        let config = SchedulerConfig::from_settings(&settings, &registry);
        let mut builder = Scheduler::builder(
            Arc::clone(&registry),
            client.clone(),
            Arc::clone(&event_bus),
            config,
        )
        .metrics(Arc::clone(&prom_metrics));
        if let Some(logs) = logstats::from_settings(&settings, &client) {
            builder = builder.log_source(logs);
        }

        Ok(Arc::new(AppState {
            settings,
            registry,
            client,
            scheduler: builder.build(),
            event_bus,
            prom_metrics,
        }))
    }

    /// Validate `node` and derive the UI variant for this request.
    pub(crate) fn request_context(
        &self,
        node: usize,
        headers: &HeaderMap,
        ui: Option<&str>,
    ) -> Result<RequestContext, ApiError> {
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());
        Ok(RequestContext::new(&self.registry, node, user_agent, ui)?)
    }
}

/// Error body shared by every route: `{"status":"error","message":...}`.
#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<ContextError> for ApiError {
    fn from(e: ContextError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            SchedulerError::UnknownTask(_) => ApiError::NotFound(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Conflict(m) => m,
        };
        warn!(status = status.as_u16(), message = %message, "request rejected");
        (
            status,
            Json(serde_json::json!({"status": "error", "message": message})),
        )
            .into_response()
    }
}

/// Middleware that records HTTP request duration into the Prometheus histogram,
/// generates (or propagates) a request ID for correlation, and wraps the
/// request in a tracing span using `.instrument()` for proper async propagation.
async fn request_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Collapse node indices, UUIDs and job ids into placeholders so the
/// latency histogram keeps a bounded label set.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                seg.to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":uuid".to_string()
            } else if seg.len() == 32 && seg.chars().all(|c| c.is_ascii_hexdigit()) {
                ":job".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let deadline = state.settings.poll.response_deadline(state.registry.len());
    Router::new()
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/metrics", get(routes_health::handler_metrics))
        .route("/api/metadata", get(routes_metadata::handler_api_metadata))
        .route(
            "/api/notifications",
            get(routes_notifications::handler_api_notifications),
        )
        .route("/api/events", get(routes_notifications::handler_api_events))
        .route(
            "/{node}/servers",
            get(routes_servers::handler_servers).post(routes_servers::handler_servers_form),
        )
        .route("/{node}/api/{opt}", get(routes_api::handler_relay))
        .route(
            "/{node}/api/stop/{project}/{job}",
            post(routes_api::handler_stop),
        )
        .route(
            "/{node}/api/forcestop/{project}/{job}",
            post(routes_api::handler_forcestop),
        )
        .route("/{node}/tasks", get(routes_tasks::handler_tasks))
        .route(
            "/{node}/tasks/scheduler/{action}",
            post(routes_tasks::handler_scheduler_action),
        )
        .route(
            "/{node}/tasks/monitor/{target}/{action}",
            post(routes_tasks::handler_task_action),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            request_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            deadline,
        ))
        .with_state(state)
}

pub async fn run(settings: Settings) -> Result<()> {
    let state = AppState::new(settings)?;
    let poll = &state.settings.poll;
    if poll.enable && poll.autostart {
        state.scheduler.start()?;
    } else {
        info!(
            enable = poll.enable,
            autostart = poll.autostart,
            "polling scheduler not started"
        );
    }

    let app = build_router(Arc::clone(&state));
    let addr = format!("{}:{}", state.settings.dashboard.bind, state.settings.dashboard.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, nodes = state.registry.len(), "dashboard running");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.scheduler.shutdown().await;
    info!("dashboard shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! { _ = ctrl_c => info!("received SIGINT, shutting down"), _ = sigterm.recv() => info!("received SIGTERM, shutting down") }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
