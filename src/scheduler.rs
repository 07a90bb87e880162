//! # Scheduler — Background Polling Engine
//!
//! A process-wide loop, independent of inbound requests, that walks every
//! [`MonitoringTask`] once per round:
//!
//! 1. fetch the node's job list (`listprojects.json`, then `listjobs.json`
//!    per project),
//! 2. diff it against the task's fingerprints ([`MonitoringTask::observe`]),
//! 3. pull log summaries for running and just-finished jobs from the
//!    [`LogSource`],
//! 4. evaluate trigger thresholds and apply the resulting directives: send an
//!    alert, relay `stop.json` to the node, pause the task.
//!
//! ## State machine
//!
//! ```text
//!   Stopped --start--> Running --pause--> Paused
//!      ^                  ^  <--resume--    |
//!      +----shutdown------+-----------------+
//! ```
//!
//! The state lives in a `tokio::sync::watch` channel: request handlers read
//! it without locking the loop, and every transition is a compare-and-set on
//! the channel value. Pausing never interrupts a round already in flight; it
//! only stops the next tick from starting one. Resuming re-arms the timer one
//! full period ahead and drops the ticks missed while paused.
//!
//! A node that cannot be reached is logged and skipped for the round; the
//! other tasks carry on.

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::evaluator::{Directive, Thresholds, WorkingWindow};
use crate::events::{Alert, AlertKind, Event, EventBus, Notifier};
use crate::lock_or_recover;
use crate::logstats::{LogSource, LogSummary};
use crate::monitor::{parse_job_list, JobEvent, JobKey, JobRecord, MonitoringTask, TaskView};
use crate::node_client::{now_string, Envelope, NodeClient, NodeRequest, ResponseFormat};
use crate::prom_metrics::{Metrics, TriggerLabel};
use crate::registry::{NodeConfig, Registry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Running => "running",
            SchedulerState::Paused => "paused",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cannot {action} the scheduler while it is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SchedulerState,
    },
    #[error("node {0} is not monitored")]
    UnknownTask(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub next_run: Option<String>,
    pub round_interval_secs: u64,
    pub active_tasks: usize,
    pub paused_tasks: usize,
}

/// One recurring job registered with the scheduler.
#[derive(Clone, Debug, Serialize)]
pub struct ScheduledJob {
    pub id: &'static str,
    pub interval_secs: u64,
    pub next_run: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub round_interval: Duration,
    pub request_interval: Duration,
    pub request_timeout: Duration,
    pub running_interval_secs: u64,
    pub on_job_finished: bool,
    pub thresholds: Thresholds,
    pub window: WorkingWindow,
    pub monitored: Vec<usize>,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings, registry: &Registry) -> Self {
        SchedulerConfig {
            round_interval: settings.poll.round_interval(),
            request_interval: settings.poll.request_interval(),
            request_timeout: settings.poll.request_timeout(),
            running_interval_secs: settings.notify.on_job_running_interval_secs,
            on_job_finished: settings.notify.on_job_finished,
            thresholds: settings.notify.triggers.clone(),
            window: settings.notify.window(),
            monitored: settings.poll.monitored_indices(registry),
        }
    }
}

/// Outcome of one polling round.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RoundReport {
    pub polled: Vec<usize>,
    pub skipped: Vec<usize>,
    pub paused: Vec<usize>,
    pub alerts: usize,
    pub stopped_jobs: usize,
}

struct Inner {
    registry: Arc<Registry>,
    client: NodeClient,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    logs: Option<Arc<dyn LogSource>>,
    metrics: Option<Arc<Metrics>>,
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
    tasks: Mutex<BTreeMap<usize, MonitoringTask>>,
    next_run: Mutex<Option<DateTime<Local>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the process-wide polling scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

pub struct SchedulerBuilder {
    registry: Arc<Registry>,
    client: NodeClient,
    events: Arc<EventBus>,
    config: SchedulerConfig,
    notifier: Option<Arc<dyn Notifier>>,
    logs: Option<Arc<dyn LogSource>>,
    metrics: Option<Arc<Metrics>>,
}

impl SchedulerBuilder {
    /// Deliver alerts somewhere other than the event bus.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn log_source(mut self, logs: Arc<dyn LogSource>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Scheduler {
        let tasks = self
            .config
            .monitored
            .iter()
            .filter(|i| self.registry.resolve(**i).is_ok())
            .map(|&i| (i, MonitoringTask::new(i)))
            .collect();
        let (state, _) = watch::channel(SchedulerState::Stopped);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::clone(&self.events) as Arc<dyn Notifier>);
        Scheduler {
            inner: Arc::new(Inner {
                registry: self.registry,
                client: self.client,
                events: self.events,
                notifier,
                logs: self.logs,
                metrics: self.metrics,
                config: self.config,
                state,
                tasks: Mutex::new(tasks),
                next_run: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }
}

impl Scheduler {
    pub fn builder(
        registry: Arc<Registry>,
        client: NodeClient,
        events: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            registry,
            client,
            events,
            config,
            notifier: None,
            logs: None,
            metrics: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    /// Spawn the timer loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.inner
            .transition("start", &[SchedulerState::Stopped], SchedulerState::Running)?;
        let rx = self.inner.state.subscribe();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner, rx));
        *lock_or_recover(&self.inner.handle) = Some(handle);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), SchedulerError> {
        self.inner
            .transition("pause", &[SchedulerState::Running], SchedulerState::Paused)
    }

    pub fn resume(&self) -> Result<(), SchedulerError> {
        self.inner
            .transition("resume", &[SchedulerState::Paused], SchedulerState::Running)
    }

    /// Stop the loop and wait for it to exit. A round in flight completes
    /// first.
    pub async fn shutdown(&self) {
        let stopped = self.inner.transition(
            "shut down",
            &[SchedulerState::Running, SchedulerState::Paused],
            SchedulerState::Stopped,
        );
        if stopped.is_err() {
            return;
        }
        let handle = lock_or_recover(&self.inner.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let (active, paused) = {
            let tasks = lock_or_recover(&self.inner.tasks);
            let paused = tasks.values().filter(|t| t.paused).count();
            (tasks.len() - paused, paused)
        };
        SchedulerStatus {
            state: self.state(),
            next_run: self.inner.next_run_string(),
            round_interval_secs: self.inner.config.round_interval.as_secs(),
            active_tasks: active,
            paused_tasks: paused,
        }
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        if self.state() == SchedulerState::Stopped {
            return Vec::new();
        }
        vec![ScheduledJob {
            id: "poll_round",
            interval_secs: self.inner.config.round_interval.as_secs(),
            next_run: self.inner.next_run_string(),
        }]
    }

    /// Consistent copies of every monitoring task.
    pub fn tasks(&self) -> Vec<TaskView> {
        lock_or_recover(&self.inner.tasks)
            .values()
            .map(MonitoringTask::view)
            .collect()
    }

    pub fn task(&self, node: usize) -> Option<TaskView> {
        lock_or_recover(&self.inner.tasks)
            .get(&node)
            .map(MonitoringTask::view)
    }

    pub fn pause_task(&self, node: usize) -> Result<(), SchedulerError> {
        self.inner.set_task_paused(node, true)
    }

    pub fn resume_task(&self, node: usize) -> Result<(), SchedulerError> {
        self.inner.set_task_paused(node, false)
    }

    /// Disable monitoring for a node and forget its state.
    pub fn stop_task(&self, node: usize) -> Result<(), SchedulerError> {
        let removed = lock_or_recover(&self.inner.tasks).remove(&node);
        if removed.is_none() {
            return Err(SchedulerError::UnknownTask(node));
        }
        info!(node, "monitoring task removed");
        self.inner.update_task_gauge();
        Ok(())
    }

    /// Run one round in the foreground, whatever the scheduler state.
    pub async fn run_round(&self) -> RoundReport {
        self.inner.run_round().await
    }
}

async fn run_loop(inner: Arc<Inner>, mut rx: watch::Receiver<SchedulerState>) {
    let period = inner.config.round_interval;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = period.as_secs(), "scheduler loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *rx.borrow() != SchedulerState::Running {
                    continue;
                }
                inner.arm_next_run();
                inner.run_round().await;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *rx.borrow_and_update();
                match state {
                    SchedulerState::Stopped => break,
                    SchedulerState::Running => {
                        ticker.reset();
                        inner.arm_next_run();
                    }
                    SchedulerState::Paused => {
                        *lock_or_recover(&inner.next_run) = None;
                    }
                }
            }
        }
    }

    *lock_or_recover(&inner.next_run) = None;
    info!("scheduler loop stopped");
}

fn label_keys(d: &Directive) -> String {
    d.triggered
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Inner {
    fn transition(
        &self,
        action: &'static str,
        from: &[SchedulerState],
        to: SchedulerState,
    ) -> Result<(), SchedulerError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                true
            } else {
                result = Err(SchedulerError::InvalidTransition {
                    action,
                    state: *current,
                });
                false
            }
        });
        if result.is_ok() {
            info!(action, state = %to, "scheduler state changed");
            self.events.emit(Event::SchedulerChanged {
                state: to.to_string(),
            });
            if let Some(m) = &self.metrics {
                m.scheduler_running
                    .set(i64::from(to == SchedulerState::Running));
            }
        }
        result
    }

    fn arm_next_run(&self) {
        let next = chrono::Duration::from_std(self.config.round_interval)
            .ok()
            .map(|d| Local::now() + d);
        *lock_or_recover(&self.next_run) = next;
    }

    fn next_run_string(&self) -> Option<String> {
        let next = *lock_or_recover(&self.next_run);
        next.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    }

    fn set_task_paused(&self, node: usize, paused: bool) -> Result<(), SchedulerError> {
        {
            let mut tasks = lock_or_recover(&self.tasks);
            let task = tasks.get_mut(&node).ok_or(SchedulerError::UnknownTask(node))?;
            task.paused = paused;
        }
        info!(node, paused, "monitoring task updated");
        self.update_task_gauge();
        Ok(())
    }

    fn update_task_gauge(&self) {
        if let Some(m) = &self.metrics {
            let active = lock_or_recover(&self.tasks)
                .values()
                .filter(|t| !t.paused)
                .count();
            m.monitored_tasks.set(active as i64);
        }
    }

    async fn run_round(&self) -> RoundReport {
        let mut report = RoundReport::default();
        let nodes: Vec<usize> = lock_or_recover(&self.tasks).keys().copied().collect();
        info!(tasks = nodes.len(), "poll round started");

        for &node in &nodes {
            let paused = lock_or_recover(&self.tasks).get(&node).map(|t| t.paused);
            match paused {
                None => continue,
                Some(true) => {
                    debug!(node, "monitoring task paused, skipping");
                    report.paused.push(node);
                    continue;
                }
                Some(false) => {}
            }
            let contacted = report.polled.len() + report.skipped.len();
            if contacted > 0 && !self.config.request_interval.is_zero() {
                tokio::time::sleep(self.config.request_interval).await;
            }
            if self.poll_task(node, &mut report).await {
                report.polled.push(node);
            } else {
                report.skipped.push(node);
            }
        }

        if let Some(m) = &self.metrics {
            m.poll_ticks.inc();
        }
        self.update_task_gauge();
        info!(
            polled = report.polled.len(),
            skipped = report.skipped.len(),
            paused = report.paused.len(),
            alerts = report.alerts,
            stopped_jobs = report.stopped_jobs,
            "poll round finished"
        );
        report
    }

    /// Poll one node. Returns false when the node was skipped.
    async fn poll_task(&self, index: usize, report: &mut RoundReport) -> bool {
        let Ok(node) = self.registry.resolve(index).cloned() else {
            return false;
        };

        let records = match self.fetch_jobs(&node).await {
            Ok(records) => records,
            Err(env) => {
                warn!(
                    node = index,
                    kind = env.kind.label(),
                    status_code = env.status_code,
                    message = %env.message,
                    "node unavailable, skipping this round"
                );
                if let Some(task) = lock_or_recover(&self.tasks).get_mut(&index) {
                    task.last_error = Some(env.message.clone());
                }
                self.events.emit(Event::NodeSkipped {
                    node: index,
                    message: env.message,
                });
                return false;
            }
        };

        let now = Local::now();
        let (job_events, candidates) = {
            let mut tasks = lock_or_recover(&self.tasks);
            let Some(task) = tasks.get_mut(&index) else {
                return true;
            };
            let events = task.observe(&records, now.naive_local(), self.config.running_interval_secs);
            task.last_polled = Some(now_string());
            task.last_error = None;
            (events, task.log_candidates())
        };

        let day_allowed = self.config.window.day_allowed(&now);
        let hour_allowed = self.config.window.hour_allowed(&now);

        let summaries: HashMap<JobKey, LogSummary> = match &self.logs {
            Some(logs) if !candidates.is_empty() => logs.summaries(&node, &candidates).await,
            _ => HashMap::new(),
        };

        if day_allowed && hour_allowed {
            for event in &job_events {
                if let Some(alert) = self.lifecycle_alert(index, event, summaries.get(event.key())) {
                    self.notifier.notify(&alert);
                    report.alerts += 1;
                }
            }
        }

        let directives: Vec<(JobKey, Directive, LogSummary)> = {
            let mut tasks = lock_or_recover(&self.tasks);
            let Some(task) = tasks.get_mut(&index) else {
                return true;
            };
            candidates
                .iter()
                .filter_map(|key| {
                    let summary = summaries.get(key)?;
                    task.evaluate_job(
                        key,
                        &summary.counts,
                        &self.config.thresholds,
                        day_allowed,
                        hour_allowed,
                    )
                    .map(|d| (key.clone(), d, summary.clone()))
                })
                .collect()
        };

        for (key, directive, summary) in directives {
            self.apply_directive(&node, &key, &directive, &summary, report)
                .await;
        }
        true
    }

    async fn fetch_jobs(&self, node: &NodeConfig) -> Result<Vec<JobRecord>, Envelope> {
        let timeout = self.config.request_timeout;
        let req = NodeRequest::get(node, "listprojects.json").timeout(timeout);
        let env = self.client.call(&req, ResponseFormat::Json).await;
        if !env.is_ok() {
            return Err(env);
        }
        let projects: Vec<String> = env
            .field("projects")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let mut records = Vec::new();
        for project in projects {
            let req = NodeRequest::get(node, "listjobs.json")
                .query("project", &project)
                .timeout(timeout);
            let env = self.client.call(&req, ResponseFormat::Json).await;
            if !env.is_ok() {
                return Err(env);
            }
            if let Some(payload) = env.payload.as_json() {
                records.extend(parse_job_list(&project, payload));
            }
        }
        Ok(records)
    }

    fn lifecycle_alert(
        &self,
        node: usize,
        event: &JobEvent,
        summary: Option<&LogSummary>,
    ) -> Option<Alert> {
        match event {
            JobEvent::Finished { key } => {
                if !self.config.on_job_finished {
                    return None;
                }
                let details = summary
                    .and_then(|s| s.finish_reason.clone())
                    .map(|r| vec![format!("finish_reason: {}", r)])
                    .unwrap_or_default();
                Some(Alert {
                    node,
                    kind: AlertKind::JobFinished,
                    job: Some(key.clone()),
                    title: format!("Node {}: job {} finished", node, key),
                    details,
                    triggers: Vec::new(),
                })
            }
            JobEvent::RunningLong {
                key, elapsed_secs, ..
            } => Some(Alert {
                node,
                kind: AlertKind::JobRunning,
                job: Some(key.clone()),
                title: format!("Node {}: job {} still running", node, key),
                details: vec![format!("running for {}s", elapsed_secs)],
                triggers: Vec::new(),
            }),
        }
    }

    async fn apply_directive(
        &self,
        node: &NodeConfig,
        key: &JobKey,
        directive: &Directive,
        summary: &LogSummary,
        report: &mut RoundReport,
    ) {
        let keys = label_keys(directive);
        if directive.send {
            let details = directive
                .triggered
                .iter()
                .map(|k| {
                    format!(
                        "{}: {} (threshold {})",
                        k,
                        summary.counts.count(*k),
                        self.config.thresholds.rule(*k).threshold
                    )
                })
                .collect();
            self.notifier.notify(&Alert {
                node: node.index,
                kind: AlertKind::Trigger,
                job: Some(key.clone()),
                title: format!("Node {}: {} threshold reached for {}", node.index, keys, key),
                details,
                triggers: directive.triggered.clone(),
            });
            report.alerts += 1;
            if let Some(m) = &self.metrics {
                for k in &directive.triggered {
                    m.notifications
                        .get_or_create(&TriggerLabel {
                            trigger: k.as_str().to_string(),
                        })
                        .inc();
                }
            }
        } else {
            info!(node = node.index, job = %key, triggers = %keys, "threshold reached outside working hours, not sending");
        }

        if directive.stop_task {
            let running = lock_or_recover(&self.tasks)
                .get(&node.index)
                .is_some_and(|t| t.is_running_phase(key));
            if running {
                let forced = directive.pause_task;
                let env = self
                    .client
                    .stop_job(node, &key.project, &key.job, forced, self.config.request_timeout)
                    .await;
                if env.is_ok() {
                    report.stopped_jobs += 1;
                }
                self.events.emit(Event::JobStopped {
                    node: node.index,
                    job: key.clone(),
                    forced,
                    ok: env.is_ok(),
                    message: env.message,
                });
            }
            if let Some(task) = lock_or_recover(&self.tasks).get_mut(&node.index) {
                task.retire(key);
            }
        }

        if directive.pause_task {
            if let Some(task) = lock_or_recover(&self.tasks).get_mut(&node.index) {
                task.paused = true;
            }
            self.events.emit(Event::TaskPaused {
                node: node.index,
                reason: format!("{} force stop on {}", keys, key),
            });
        }
    }
}
