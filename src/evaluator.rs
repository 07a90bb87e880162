//! # Evaluator — Log-Threshold Notification Rules
//!
//! A pure decision function over one job's log summary. For each trigger key
//! the configuration gives a count threshold and two escalation flags:
//!
//! | Flag | Effect when the threshold is met |
//! |------|----------------------------------|
//! | (threshold only) | `send` |
//! | `stop` | `send` + `stop_task` |
//! | `force_stop` | `send` + `stop_task` + `pause_task` |
//!
//! A threshold of 0 disables the key. Outside the configured working days or
//! hours `send` is suppressed, but `stop_task`/`pause_task` still apply:
//! quiet hours never silence safety actions.
//!
//! The evaluator performs no I/O. Sending notifications, stopping jobs and
//! pausing monitoring tasks is the caller's job.

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Log severity category used to threshold notifications.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerKey {
    Critical,
    Error,
    Warning,
    Redirect,
    Retry,
    Ignore,
}

impl TriggerKey {
    pub const ALL: [TriggerKey; 6] = [
        TriggerKey::Critical,
        TriggerKey::Error,
        TriggerKey::Warning,
        TriggerKey::Redirect,
        TriggerKey::Retry,
        TriggerKey::Ignore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKey::Critical => "CRITICAL",
            TriggerKey::Error => "ERROR",
            TriggerKey::Warning => "WARNING",
            TriggerKey::Redirect => "REDIRECT",
            TriggerKey::Retry => "RETRY",
            TriggerKey::Ignore => "IGNORE",
        }
    }

    /// Name of the matching category in LogParser output, e.g. `error_logs`.
    pub fn log_category(&self) -> String {
        format!("{}_logs", self.as_str().to_lowercase())
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerKey::ALL
            .iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown trigger key: {}", s))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    #[serde(default)]
    pub threshold: u64,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub force_stop: bool,
}

impl TriggerRule {
    pub fn threshold(threshold: u64) -> Self {
        TriggerRule {
            threshold,
            ..Default::default()
        }
    }

    pub fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    pub fn with_force_stop(mut self) -> Self {
        self.force_stop = true;
        self
    }
}

/// Per-key rules, built once at startup from configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thresholds {
    rules: BTreeMap<TriggerKey, TriggerRule>,
}

impl Thresholds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: TriggerKey, rule: TriggerRule) -> Self {
        self.rules.insert(key, rule);
        self
    }

    pub fn rule(&self, key: TriggerKey) -> TriggerRule {
        self.rules.get(&key).copied().unwrap_or_default()
    }

    pub fn is_enabled(&self, key: TriggerKey) -> bool {
        self.rule(key).threshold > 0
    }

    /// Copy with the given keys disabled. Used to avoid re-firing keys that
    /// already triggered for a job.
    pub fn excluding(&self, fired: &BTreeSet<TriggerKey>) -> Self {
        let mut out = self.clone();
        for key in fired {
            out.rules.remove(key);
        }
        out
    }
}

/// Observed log counts for one job, keyed by trigger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogCounts {
    counts: BTreeMap<TriggerKey, u64>,
}

impl LogCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: TriggerKey, count: u64) -> Self {
        self.counts.insert(key, count);
        self
    }

    pub fn set(&mut self, key: TriggerKey, count: u64) {
        self.counts.insert(key, count);
    }

    pub fn count(&self, key: TriggerKey) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub send: bool,
    pub pause_task: bool,
    pub stop_task: bool,
    /// Keys whose threshold was met, in `TriggerKey::ALL` order.
    pub triggered: Vec<TriggerKey>,
}

impl Directive {
    pub fn is_noop(&self) -> bool {
        !self.send && !self.pause_task && !self.stop_task
    }
}

pub fn evaluate(
    event: &LogCounts,
    thresholds: &Thresholds,
    day_allowed: bool,
    hour_allowed: bool,
) -> Directive {
    let mut directive = Directive::default();
    for key in TriggerKey::ALL {
        let rule = thresholds.rule(key);
        if rule.threshold == 0 || event.count(key) < rule.threshold {
            continue;
        }
        directive.triggered.push(key);
        if rule.stop || rule.force_stop {
            directive.stop_task = true;
        }
        if rule.force_stop {
            directive.pause_task = true;
        }
    }
    directive.send = !directive.triggered.is_empty() && day_allowed && hour_allowed;
    directive
}

/// Working-day and working-hour window for notifications. Empty lists allow
/// everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingWindow {
    /// ISO weekday numbers, Monday = 1 .. Sunday = 7.
    #[serde(default)]
    pub days: Vec<u32>,
    #[serde(default)]
    pub hours: Vec<u32>,
}

impl WorkingWindow {
    pub fn day_allowed<T: Datelike>(&self, t: &T) -> bool {
        self.days.is_empty() || self.days.contains(&t.weekday().number_from_monday())
    }

    pub fn hour_allowed<T: Timelike>(&self, t: &T) -> bool {
        self.hours.is_empty() || self.hours.contains(&t.hour())
    }
}
