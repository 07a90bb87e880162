//! # Mock Node — Simulated Scrapyd Node for Integration Tests
//!
//! An in-process axum server that answers the subset of the Scrapyd JSON API
//! crawldeck talks to, plus the LogParser `stats.json` document.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/daemonstatus.json` | Job counters |
//! | GET | `/listprojects.json` | Project names |
//! | GET | `/listversions.json` | Versions of a project |
//! | GET | `/listspiders.json` | Spiders of a project |
//! | GET | `/listjobs.json` | Pending/running/finished jobs of a project |
//! | POST | `/stop.json` | Records the stop request, cancels the job |
//! | GET | `/logs/stats.json` | Per-job log category counts |
//!
//! ```text
//! MockNode::start()
//!   └─ TcpListener::bind("127.0.0.1:0")   (random port)
//!   └─ axum::serve(listener, router)       (background tokio task)
//!   └─ SharedState (Arc<Mutex<MockState>>) (jobs, stats, request log)
//! ```
//!
//! The server task is aborted when the `MockNode` is dropped. `HungNode` is
//! the opposite case: it accepts connections and never answers.

#![allow(dead_code)]

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

pub const JOB_TIME: &str = "2024-01-08 10:00:00.000000";

#[derive(Clone, Debug)]
struct MockJob {
    spider: String,
    id: String,
    phase: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopRequest {
    pub project: String,
    pub job: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    jobs: BTreeMap<String, Vec<MockJob>>,
    /// `datas.<project>.<spider>.<job>.log_categories`
    log_counts: BTreeMap<(String, String, String), BTreeMap<String, u64>>,
    /// Overrides `/daemonstatus.json` with this HTTP status.
    daemonstatus_error: Option<u16>,
    /// Serve `/daemonstatus.json` as HTML instead of JSON.
    daemonstatus_html: bool,
    stop_requests: Vec<StopRequest>,
    authorizations: Vec<Option<String>>,
}

type SharedState = Arc<Mutex<MockState>>;

pub struct MockNode {
    addr: SocketAddr,
    _abort_handle: tokio::task::AbortHandle,
    state: SharedState,
}

impl MockNode {
    pub async fn start() -> Self {
        let state: SharedState = Arc::new(Mutex::new(MockState::default()));
        let app = Router::new()
            .route("/daemonstatus.json", get(daemonstatus))
            .route("/listprojects.json", get(listprojects))
            .route("/listversions.json", get(listversions))
            .route("/listspiders.json", get(listspiders))
            .route("/listjobs.json", get(listjobs))
            .route("/stop.json", post(stop))
            .route("/logs/stats.json", get(stats))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockNode {
            addr,
            _abort_handle: handle.abort_handle(),
            state,
        }
    }

    /// `host:port` as it appears in the node list.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn add_project(&self, project: &str) {
        self.state
            .lock()
            .unwrap()
            .jobs
            .entry(project.to_string())
            .or_default();
    }

    pub fn add_job(&self, project: &str, spider: &str, id: &str, phase: &'static str) {
        self.state
            .lock()
            .unwrap()
            .jobs
            .entry(project.to_string())
            .or_default()
            .push(MockJob {
                spider: spider.to_string(),
                id: id.to_string(),
                phase,
            });
    }

    pub fn set_phase(&self, project: &str, id: &str, phase: &'static str) {
        let mut st = self.state.lock().unwrap();
        if let Some(job) = st
            .jobs
            .get_mut(project)
            .and_then(|jobs| jobs.iter_mut().find(|j| j.id == id))
        {
            job.phase = phase;
        }
    }

    pub fn set_log_count(&self, project: &str, spider: &str, id: &str, category: &str, count: u64) {
        self.state
            .lock()
            .unwrap()
            .log_counts
            .entry((project.to_string(), spider.to_string(), id.to_string()))
            .or_default()
            .insert(category.to_string(), count);
    }

    pub fn fail_daemonstatus(&self, status: u16) {
        self.state.lock().unwrap().daemonstatus_error = Some(status);
    }

    pub fn serve_html_daemonstatus(&self) {
        self.state.lock().unwrap().daemonstatus_html = true;
    }

    pub fn stop_requests(&self) -> Vec<StopRequest> {
        self.state.lock().unwrap().stop_requests.clone()
    }

    /// `Authorization` header of every request received, in order.
    pub fn authorizations(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().authorizations.clone()
    }
}

/// A node that accepts connections and reads requests but never answers.
/// Tracks how many client connections are still open.
pub struct HungNode {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl HungNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let (acc, opn) = (Arc::clone(&accepted), Arc::clone(&open));
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                acc.fetch_add(1, Ordering::SeqCst);
                opn.fetch_add(1, Ordering::SeqCst);
                let opn = Arc::clone(&opn);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    // Read until the client hangs up.
                    while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
                    opn.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        HungNode {
            addr,
            accepted,
            open,
            handle,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for HungNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An address nothing listens on: bind a port, then release it.
pub async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// Blocking variant of [`closed_address`] for non-async tests.
pub fn closed_address_blocking() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn record_auth(state: &SharedState, headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.lock().unwrap().authorizations.push(auth.clone());
    auth
}

fn job_json(project: &str, job: &MockJob) -> Value {
    let mut entry = json!({"id": job.id, "spider": job.spider, "project": project});
    if job.phase != "pending" {
        entry["start_time"] = json!(JOB_TIME);
    }
    if job.phase == "finished" {
        entry["end_time"] = json!("2024-01-08 10:30:00.000000");
    }
    entry
}

async fn daemonstatus(State(state): State<SharedState>, headers: HeaderMap) -> impl IntoResponse {
    record_auth(&state, &headers);
    let st = state.lock().unwrap();
    if let Some(code) = st.daemonstatus_error {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "internal failure".to_string()).into_response();
    }
    if st.daemonstatus_html {
        return (StatusCode::OK, "<html>maintenance</html>".to_string()).into_response();
    }
    let count = |phase: &str| {
        st.jobs
            .values()
            .flatten()
            .filter(|j| j.phase == phase)
            .count()
    };
    Json(json!({
        "status": "ok",
        "node_name": "mock",
        "pending": count("pending"),
        "running": count("running"),
        "finished": count("finished"),
    }))
    .into_response()
}

async fn listprojects(State(state): State<SharedState>, headers: HeaderMap) -> impl IntoResponse {
    record_auth(&state, &headers);
    let projects: Vec<String> = state.lock().unwrap().jobs.keys().cloned().collect();
    Json(json!({"status": "ok", "projects": projects}))
}

#[derive(Deserialize)]
struct ProjectQuery {
    project: Option<String>,
}

fn unknown_project(project: &str) -> Json<Value> {
    Json(json!({
        "status": "error",
        "message": format!("project '{}' not found\\nSee the project list", project),
    }))
}

async fn listversions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<ProjectQuery>,
) -> impl IntoResponse {
    record_auth(&state, &headers);
    let project = q.project.unwrap_or_default();
    if !state.lock().unwrap().jobs.contains_key(&project) {
        return unknown_project(&project);
    }
    Json(json!({"status": "ok", "versions": ["1704700000"]}))
}

async fn listspiders(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<ProjectQuery>,
) -> impl IntoResponse {
    record_auth(&state, &headers);
    let project = q.project.unwrap_or_default();
    let st = state.lock().unwrap();
    let Some(jobs) = st.jobs.get(&project) else {
        return unknown_project(&project);
    };
    let mut spiders: Vec<String> = jobs.iter().map(|j| j.spider.clone()).collect();
    spiders.sort();
    spiders.dedup();
    Json(json!({"status": "ok", "spiders": spiders}))
}

async fn listjobs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<ProjectQuery>,
) -> impl IntoResponse {
    record_auth(&state, &headers);
    let project = q.project.unwrap_or_default();
    let st = state.lock().unwrap();
    let Some(jobs) = st.jobs.get(&project) else {
        return unknown_project(&project);
    };
    let by_phase = |phase: &str| -> Vec<Value> {
        jobs.iter()
            .filter(|j| j.phase == phase)
            .map(|j| job_json(&project, j))
            .collect()
    };
    Json(json!({
        "status": "ok",
        "pending": by_phase("pending"),
        "running": by_phase("running"),
        "finished": by_phase("finished"),
    }))
}

#[derive(Deserialize)]
struct StopForm {
    project: String,
    job: String,
}

async fn stop(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Form(form): Form<StopForm>,
) -> impl IntoResponse {
    let authorization = record_auth(&state, &headers);
    let mut st = state.lock().unwrap();
    st.stop_requests.push(StopRequest {
        project: form.project.clone(),
        job: form.job.clone(),
        authorization,
    });
    let prevstate = st
        .jobs
        .get_mut(&form.project)
        .and_then(|jobs| jobs.iter_mut().find(|j| j.id == form.job))
        .map(|j| {
            let prev = j.phase;
            j.phase = "finished";
            prev
        });
    Json(json!({"status": "ok", "prevstate": prevstate}))
}

async fn stats(State(state): State<SharedState>, headers: HeaderMap) -> impl IntoResponse {
    record_auth(&state, &headers);
    let st = state.lock().unwrap();
    let mut datas = json!({});
    for ((project, spider, job), counts) in &st.log_counts {
        let categories: serde_json::Map<String, Value> = counts
            .iter()
            .map(|(cat, n)| (cat.clone(), json!({"count": n, "details": []})))
            .collect();
        datas[project][spider][job] = json!({
            "pages": 10,
            "items": 5,
            "finish_reason": "N/A",
            "log_categories": categories,
        });
    }
    Json(json!({"status": "ok", "datas": datas}))
}
