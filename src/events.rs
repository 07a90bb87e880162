//! # Events — Notification Sink and Activity Log
//!
//! A bounded, thread-safe event log that collects what the polling scheduler
//! does and turns the operator-facing parts into notifications.
//!
//! ## Event Types
//!
//! | Variant | Emitted When | Notification |
//! |---------|-------------|--------------|
//! | `Alert` | A directive says `send`, or a job finished / keeps running | yes |
//! | `JobStopped` | A stop directive was relayed to a node | yes |
//! | `TaskPaused` | A force-stop directive paused a monitoring task | yes |
//! | `SchedulerChanged` | The scheduler started, paused, resumed or stopped | no |
//! | `NodeSkipped` | A node could not be polled this round | no |
//!
//! ## Delivery
//!
//! Events are stored in a `VecDeque` bounded to the most recent 200 and
//! notifications in one bounded to 50. Each notification gets a monotonic
//! `id` so pollers can tell which ones they have already seen. Mail delivery
//! is not bundled: a deployment implements [`Notifier`] and hands it to the
//! scheduler instead of (or wrapping) the [`EventBus`].

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::evaluator::TriggerKey;
use crate::lock_or_recover;
use crate::monitor::JobKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Trigger,
    JobFinished,
    JobRunning,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Trigger => "trigger",
            AlertKind::JobFinished => "job_finished",
            AlertKind::JobRunning => "job_running",
        }
    }
}

/// A message the operator should receive.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub node: usize,
    pub kind: AlertKind,
    pub job: Option<JobKey>,
    pub title: String,
    pub details: Vec<String>,
    pub triggers: Vec<TriggerKey>,
}

/// Destination for alerts the scheduler decided to send.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Events emitted by the polling scheduler.
#[derive(Clone, Debug)]
pub enum Event {
    Alert(Alert),
    JobStopped {
        node: usize,
        job: JobKey,
        forced: bool,
        ok: bool,
        message: String,
    },
    TaskPaused {
        node: usize,
        reason: String,
    },
    SchedulerChanged {
        state: String,
    },
    NodeSkipped {
        node: usize,
        message: String,
    },
}

/// A notification ready for the `/api/notifications` endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct Notification {
    pub id: u64,
    pub kind: String,
    pub node: Option<usize>,
    pub title: String,
    pub details: Vec<String>,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub kind: String,
    pub message: String,
    pub elapsed_secs: f64,
}

pub struct EventBus {
    recent: Mutex<VecDeque<EventRecord>>,
    notifications: Mutex<VecDeque<Notification>>,
    next_id: AtomicU64,
    start: Instant,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

const RECENT_EVENTS_CAP: usize = 200;
const NOTIFICATIONS_CAP: usize = 50;

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAP)),
            notifications: Mutex::new(VecDeque::with_capacity(NOTIFICATIONS_CAP)),
            next_id: AtomicU64::new(1),
            start: Instant::now(),
        }
    }

    pub fn emit(&self, event: Event) {
        let elapsed = self.start.elapsed().as_secs_f64();

        match event {
            Event::Alert(alert) => {
                tracing::warn!(
                    node = alert.node,
                    kind = alert.kind.as_str(),
                    job = alert.job.as_ref().map(|j| j.to_string()).unwrap_or_default(),
                    "{}",
                    alert.title
                );
                self.push_record(alert.kind.as_str(), &alert.title, elapsed);
                self.push_notification(alert.kind.as_str(), Some(alert.node), alert.title, alert.details);
            }
            Event::JobStopped {
                node,
                job,
                forced,
                ok,
                message,
            } => {
                let verb = if forced { "force-stopped" } else { "stopped" };
                let title = if ok {
                    format!("Node {}: {} job {}", node, verb, job)
                } else {
                    format!("Node {}: failed to stop job {}", node, job)
                };
                tracing::warn!(node, job = %job, forced, ok, "{}", title);
                self.push_record("job_stopped", &title, elapsed);
                let details = if message.is_empty() { vec![] } else { vec![message] };
                self.push_notification("job_stopped", Some(node), title, details);
            }
            Event::TaskPaused { node, reason } => {
                let title = format!("Node {}: monitoring paused", node);
                tracing::warn!(node, reason = %reason, "monitoring task paused");
                self.push_record("task_paused", &format!("{} ({})", title, reason), elapsed);
                self.push_notification("task_paused", Some(node), title, vec![reason]);
            }
            Event::SchedulerChanged { state } => {
                tracing::info!(state = %state, "scheduler state changed");
                self.push_record("scheduler", &format!("scheduler {}", state), elapsed);
            }
            Event::NodeSkipped { node, message } => {
                self.push_record("warning", &format!("[node {}] {}", node, message), elapsed);
            }
        }
    }

    /// Most recent notifications first.
    pub fn recent_notifications(&self, limit: usize) -> Vec<Notification> {
        let notifs = lock_or_recover(&self.notifications);
        notifs.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent events first.
    pub fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        let events = lock_or_recover(&self.recent);
        events.iter().rev().take(limit).cloned().collect()
    }

    fn push_record(&self, kind: &str, message: &str, elapsed: f64) {
        let mut recent = lock_or_recover(&self.recent);
        if recent.len() >= RECENT_EVENTS_CAP {
            recent.pop_front();
        }
        recent.push_back(EventRecord {
            kind: kind.into(),
            message: message.into(),
            elapsed_secs: elapsed,
        });
    }

    fn push_notification(&self, kind: &str, node: Option<usize>, title: String, details: Vec<String>) {
        let mut notifs = lock_or_recover(&self.notifications);
        if notifs.len() >= NOTIFICATIONS_CAP {
            notifs.pop_front();
        }
        notifs.push_back(Notification {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: kind.into(),
            node,
            title,
            details,
            timestamp_ms: now_ms(),
        });
    }
}

impl Notifier for EventBus {
    fn notify(&self, alert: &Alert) {
        self.emit(Event::Alert(alert.clone()));
    }
}
