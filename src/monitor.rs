//! # Monitor — Per-Node Monitoring Tasks
//!
//! A [`MonitoringTask`] remembers what the scheduler saw on one node during
//! the previous round: a fingerprint per job, the trigger keys that already
//! fired for it, how many "still running" notices were sent, and whether it
//! was retired after a stop. Each round the scheduler feeds the freshly
//! fetched job list into [`MonitoringTask::observe`], which diffs it against
//! those fingerprints and returns the lifecycle events worth reporting.
//!
//! The first observation only records a baseline: jobs that were already
//! finished before monitoring began are not reported.
//!
//! Tasks are owned by the scheduler. Display code reads them through
//! [`MonitoringTask::view`], which copies the state.

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::evaluator::{evaluate, Directive, LogCounts, Thresholds, TriggerKey};

/// Identity of one crawl job on a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobKey {
    pub project: String,
    pub spider: String,
    pub job: String,
}

impl JobKey {
    pub fn new(project: &str, spider: &str, job: &str) -> Self {
        JobKey {
            project: project.to_string(),
            spider: spider.to_string(),
            job: job.to_string(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.spider, self.job)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Pending,
    Running,
    Finished,
}

/// One row of a node's job listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub phase: JobPhase,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// Read the `pending`/`running`/`finished` arrays of a `listjobs.json`
/// payload. Entries carrying their own `project` field override `project`.
pub fn parse_job_list(project: &str, payload: &Value) -> Vec<JobRecord> {
    let mut out = Vec::new();
    for (field, phase) in [
        ("pending", JobPhase::Pending),
        ("running", JobPhase::Running),
        ("finished", JobPhase::Finished),
    ] {
        let Some(entries) = payload.get(field).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            let text = |k: &str| {
                entry
                    .get(k)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            out.push(JobRecord {
                key: JobKey {
                    project: text("project").unwrap_or_else(|| project.to_string()),
                    spider: text("spider").unwrap_or_default(),
                    job: id.to_string(),
                },
                phase,
                start_time: text("start_time"),
                end_time: text("end_time"),
            });
        }
    }
    out
}

/// Parse a node timestamp such as `2024-01-08 10:00:00.123456`.
pub fn parse_node_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// Lifecycle change detected between two rounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Finished { key: JobKey },
    RunningLong {
        key: JobKey,
        elapsed_secs: u64,
        notice: u64,
    },
}

impl JobEvent {
    pub fn key(&self) -> &JobKey {
        match self {
            JobEvent::Finished { key } | JobEvent::RunningLong { key, .. } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Fingerprint {
    phase: JobPhase,
    start_time: Option<String>,
    end_time: Option<String>,
}

#[derive(Clone, Debug)]
struct JobTrack {
    fingerprint: Fingerprint,
    fired: BTreeSet<TriggerKey>,
    running_notices: u64,
    retired: bool,
    just_finished: bool,
}

#[derive(Clone, Debug)]
pub struct MonitoringTask {
    pub node: usize,
    pub paused: bool,
    pub rounds: u64,
    pub last_polled: Option<String>,
    pub last_error: Option<String>,
    baseline: bool,
    jobs: BTreeMap<JobKey, JobTrack>,
}

impl MonitoringTask {
    pub fn new(node: usize) -> Self {
        MonitoringTask {
            node,
            paused: false,
            rounds: 0,
            last_polled: None,
            last_error: None,
            baseline: false,
            jobs: BTreeMap::new(),
        }
    }

    /// Diff a fresh job listing against the previous round.
    ///
    /// `running_interval_secs == 0` disables "still running" notices.
    pub fn observe(
        &mut self,
        records: &[JobRecord],
        now: NaiveDateTime,
        running_interval_secs: u64,
    ) -> Vec<JobEvent> {
        let mut events = Vec::new();
        let mut next = BTreeMap::new();

        for record in records {
            let fingerprint = Fingerprint {
                phase: record.phase,
                start_time: record.start_time.clone(),
                end_time: record.end_time.clone(),
            };
            let prior = self.jobs.remove(&record.key);
            let prior_phase = prior.as_ref().map(|t| t.fingerprint.phase);
            let mut track = prior.unwrap_or_else(|| JobTrack {
                fingerprint: fingerprint.clone(),
                fired: BTreeSet::new(),
                running_notices: 0,
                retired: false,
                just_finished: false,
            });

            track.just_finished = false;
            if record.phase == JobPhase::Finished
                && self.baseline
                && prior_phase != Some(JobPhase::Finished)
            {
                track.just_finished = true;
                events.push(JobEvent::Finished {
                    key: record.key.clone(),
                });
            }

            if record.phase == JobPhase::Running && running_interval_secs > 0 && !track.retired {
                if let Some(started) = record.start_time.as_deref().and_then(parse_node_time) {
                    let elapsed = (now - started).num_seconds().max(0) as u64;
                    let due = elapsed / running_interval_secs;
                    if due > track.running_notices {
                        track.running_notices = due;
                        events.push(JobEvent::RunningLong {
                            key: record.key.clone(),
                            elapsed_secs: elapsed,
                            notice: due,
                        });
                    }
                }
            }

            track.fingerprint = fingerprint;
            next.insert(record.key.clone(), track);
        }

        self.jobs = next;
        self.baseline = true;
        self.rounds += 1;
        events
    }

    /// Jobs whose logs should be checked this round: running jobs and jobs
    /// that just finished, unless retired.
    pub fn log_candidates(&self) -> Vec<JobKey> {
        self.jobs
            .iter()
            .filter(|(_, t)| {
                !t.retired && (t.fingerprint.phase == JobPhase::Running || t.just_finished)
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Evaluate one job's log counts, skipping keys that already fired for
    /// it. Returns `None` when nothing new triggered.
    pub fn evaluate_job(
        &mut self,
        key: &JobKey,
        counts: &LogCounts,
        thresholds: &Thresholds,
        day_allowed: bool,
        hour_allowed: bool,
    ) -> Option<Directive> {
        let track = self.jobs.get_mut(key)?;
        if track.retired {
            return None;
        }
        let directive = evaluate(
            counts,
            &thresholds.excluding(&track.fired),
            day_allowed,
            hour_allowed,
        );
        if directive.triggered.is_empty() {
            return None;
        }
        track.fired.extend(directive.triggered.iter().copied());
        Some(directive)
    }

    /// Stop watching a job's logs after it was stopped.
    pub fn retire(&mut self, key: &JobKey) {
        if let Some(track) = self.jobs.get_mut(key) {
            track.retired = true;
        }
    }

    pub fn is_running_phase(&self, key: &JobKey) -> bool {
        self.jobs
            .get(key)
            .is_some_and(|t| t.fingerprint.phase == JobPhase::Running)
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs
            .values()
            .filter(|t| t.fingerprint.phase == JobPhase::Running)
            .count()
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            node: self.node,
            paused: self.paused,
            rounds: self.rounds,
            last_polled: self.last_polled.clone(),
            last_error: self.last_error.clone(),
            running_jobs: self.running_jobs(),
            jobs: self
                .jobs
                .iter()
                .map(|(k, t)| JobView {
                    key: k.clone(),
                    phase: t.fingerprint.phase,
                    fired: t.fired.iter().copied().collect(),
                    running_notices: t.running_notices,
                    retired: t.retired,
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub key: JobKey,
    pub phase: JobPhase,
    pub fired: Vec<TriggerKey>,
    pub running_notices: u64,
    pub retired: bool,
}

/// Point-in-time copy of a task for display.
#[derive(Clone, Debug, Serialize)]
pub struct TaskView {
    pub node: usize,
    pub paused: bool,
    pub rounds: u64,
    pub last_polled: Option<String>,
    pub last_error: Option<String>,
    pub running_jobs: usize,
    pub jobs: Vec<JobView>,
}
