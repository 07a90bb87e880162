//! TOML configuration structs, parsing, and validation.
//!
//! A crawldeck TOML file describes the node cluster and how it is watched:
//! dashboard identity and feature switches, the ordered node list, the
//! LogParser location, polling intervals, and notification rules. Every
//! field has a default, so an empty file yields a single local node.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::evaluator::{Thresholds, WorkingWindow};
use crate::registry::{NodeAuth, NodeSpec, Registry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one node must be configured")]
    NoNodes,
    #[error("node {index}: invalid address '{address}'")]
    InvalidAddress { index: usize, address: String },
    #[error("node {index}: username and password must be given together")]
    IncompleteAuth { index: usize },
    #[error("dashboard.enable_auth requires both username and password")]
    DashboardAuth,
    #[error("notify.working_days: {0} is not an ISO weekday (1-7)")]
    InvalidDay(u32),
    #[error("notify.working_hours: {0} is not an hour (0-23)")]
    InvalidHour(u32),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("poll.monitored_nodes: {index} is not a node, which should be between 1 and {count}")]
    UnknownMonitoredNode { index: usize, count: usize },
}

// ── TOML Configuration Structs ──────────────────────────────────

/// Top-level settings parsed from a crawldeck TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub logparser: LogParserConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            dashboard: DashboardConfig::default(),
            nodes: default_nodes(),
            logparser: LogParserConfig::default(),
            poll: PollConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

fn default_nodes() -> Vec<NodeEntry> {
    vec![NodeEntry {
        address: "127.0.0.1:6800".to_string(),
        group: String::new(),
        username: None,
        password: None,
    }]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobsStyle {
    #[default]
    Cache,
    Database,
}

/// The `[dashboard]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub bind: String,
    pub port: u16,
    pub enable_auth: bool,
    pub username: String,
    pub password: String,
    pub enable_https: bool,
    /// Empty means the bundled demo projects directory.
    pub projects_dir: String,
    pub jobs_style: JobsStyle,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            bind: "0.0.0.0".to_string(),
            port: 5000,
            enable_auth: false,
            username: String::new(),
            password: String::new(),
            enable_https: false,
            projects_dir: String::new(),
            jobs_style: JobsStyle::Cache,
        }
    }
}

/// One `[[nodes]]` entry. Order defines the 1-based node index.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    #[serde(default)]
    pub group: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// The `[logparser]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogParserConfig {
    pub enable: bool,
    pub stats_path: String,
}

impl Default for LogParserConfig {
    fn default() -> Self {
        LogParserConfig {
            enable: true,
            stats_path: "logs/stats.json".to_string(),
        }
    }
}

const RESPONSE_HEADROOM: Duration = Duration::from_secs(5);

/// The `[poll]` section: polling scheduler timing and scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub enable: bool,
    pub autostart: bool,
    pub round_interval_secs: u64,
    /// Pause between two node requests within one round. 0 disables pacing.
    pub request_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_concurrency: usize,
    /// Empty means every configured node.
    pub monitored_nodes: Vec<usize>,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            enable: false,
            autostart: true,
            round_interval_secs: 300,
            request_interval_secs: 10,
            request_timeout_secs: 60,
            max_concurrency: 8,
            monitored_nodes: Vec::new(),
        }
    }
}

impl PollConfig {
    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.round_interval_secs)
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_secs(self.request_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Upper bound on one dashboard response. A fan-out over `nodes` nodes
    /// runs in `nodes / max_concurrency` batches of node calls and a forced
    /// stop makes two calls in a row, so the deadline covers the larger of
    /// the two plus some headroom. Slow nodes then surface as per-node
    /// transport errors instead of a failed page.
    pub fn response_deadline(&self, nodes: usize) -> Duration {
        let batches = nodes.div_ceil(self.max_concurrency.max(1)).max(2);
        let batches = u32::try_from(batches).unwrap_or(u32::MAX);
        self.request_timeout().saturating_mul(batches) + RESPONSE_HEADROOM
    }

    pub fn monitored_indices(&self, registry: &Registry) -> Vec<usize> {
        if self.monitored_nodes.is_empty() {
            registry.indices()
        } else {
            self.monitored_nodes.clone()
        }
    }
}

/// The `[notify]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub working_days: Vec<u32>,
    pub working_hours: Vec<u32>,
    /// Re-notify about a running job every this many seconds. 0 disables.
    pub on_job_running_interval_secs: u64,
    pub on_job_finished: bool,
    pub triggers: Thresholds,
}

impl NotifyConfig {
    pub fn window(&self) -> WorkingWindow {
        WorkingWindow {
            days: self.working_days.clone(),
            hours: self.working_hours.clone(),
        }
    }
}

// ── Parsing ─────────────────────────────────────────────────────

impl Settings {
    pub fn registry(&self) -> Registry {
        Registry::new(
            self.nodes
                .iter()
                .map(|n| NodeSpec {
                    address: n.address.clone(),
                    group: n.group.clone(),
                    auth: match (&n.username, &n.password) {
                        (Some(u), Some(p)) => Some(NodeAuth {
                            username: u.clone(),
                            password: p.clone(),
                        }),
                        _ => None,
                    },
                })
                .collect(),
        )
    }

    /// Check the settings for logical consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let index = i + 1;
            let parsed = url::Url::parse(&format!("http://{}", node.address));
            let has_host = parsed
                .as_ref()
                .map(|u| u.host_str().is_some_and(|h| !h.is_empty()))
                .unwrap_or(false);
            if node.address.trim().is_empty() || !has_host {
                return Err(ConfigError::InvalidAddress {
                    index,
                    address: node.address.clone(),
                });
            }
            if node.username.is_some() != node.password.is_some() {
                return Err(ConfigError::IncompleteAuth { index });
            }
        }

        if self.dashboard.enable_auth
            && (self.dashboard.username.is_empty() || self.dashboard.password.is_empty())
        {
            return Err(ConfigError::DashboardAuth);
        }

        if let Some(&day) = self.notify.working_days.iter().find(|d| !(1..=7).contains(*d)) {
            return Err(ConfigError::InvalidDay(day));
        }
        if let Some(&hour) = self.notify.working_hours.iter().find(|h| **h > 23) {
            return Err(ConfigError::InvalidHour(hour));
        }

        if self.poll.round_interval_secs == 0 {
            return Err(ConfigError::Zero("poll.round_interval_secs"));
        }
        if self.poll.request_timeout_secs == 0 {
            return Err(ConfigError::Zero("poll.request_timeout_secs"));
        }
        if self.poll.max_concurrency == 0 {
            return Err(ConfigError::Zero("poll.max_concurrency"));
        }

        let count = self.nodes.len();
        if let Some(&index) = self
            .poll
            .monitored_nodes
            .iter()
            .find(|i| **i == 0 || **i > count)
        {
            return Err(ConfigError::UnknownMonitoredNode { index, count });
        }
        Ok(())
    }
}

/// Parse settings from a TOML string.
pub fn parse_toml(content: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(content).context("invalid configuration TOML")?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from `path`, falling back to defaults when the file does not
/// exist.
pub fn load(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_toml(&content).with_context(|| format!("failed to load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{TriggerKey, TriggerRule};
    use std::io::Write;

    #[test]
    fn empty_file_yields_one_local_node() {
        let s = parse_toml("").unwrap();
        assert_eq!(s.nodes.len(), 1);
        assert_eq!(s.nodes[0].address, "127.0.0.1:6800");
        assert_eq!(s.dashboard.port, 5000);
        assert_eq!(s.poll.round_interval(), Duration::from_secs(300));
        assert_eq!(s.poll.request_interval(), Duration::from_secs(10));
        assert_eq!(s.poll.request_timeout(), Duration::from_secs(60));
        assert!(!s.poll.enable);
        assert!(s.logparser.enable);
        assert_eq!(s.dashboard.jobs_style, JobsStyle::Cache);
    }

    #[test]
    fn response_deadline_outlasts_node_calls() {
        let mut poll = PollConfig::default();
        assert_eq!(poll.response_deadline(1), Duration::from_secs(125));
        assert!(poll.response_deadline(8) > poll.request_timeout());

        poll.request_timeout_secs = 10;
        poll.max_concurrency = 4;
        assert_eq!(poll.response_deadline(4), Duration::from_secs(25));
        assert_eq!(poll.response_deadline(9), Duration::from_secs(35));
    }

    #[test]
    fn full_file_parses_every_section() {
        let s = parse_toml(
            r#"
            [dashboard]
            port = 5001
            jobs_style = "database"

            [[nodes]]
            address = "10.0.0.1:6800"
            group = "east"

            [[nodes]]
            address = "10.0.0.2:6800"
            username = "admin"
            password = "secret"

            [poll]
            enable = true
            round_interval_secs = 60
            request_interval_secs = 0
            monitored_nodes = [2]

            [notify]
            working_days = [1, 2, 3, 4, 5]
            working_hours = [9, 10, 11]
            on_job_finished = true

            [notify.triggers.ERROR]
            threshold = 5

            [notify.triggers.CRITICAL]
            threshold = 1
            force_stop = true
            "#,
        )
        .unwrap();

        assert_eq!(s.dashboard.jobs_style, JobsStyle::Database);
        let reg = s.registry();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.group_of(1).unwrap(), "east");
        assert_eq!(reg.auth_of(2).unwrap().unwrap().username, "admin");
        assert_eq!(s.poll.monitored_indices(&reg), vec![2]);
        assert_eq!(s.notify.window().days, vec![1, 2, 3, 4, 5]);
        assert_eq!(s.notify.triggers.rule(TriggerKey::Error), TriggerRule::threshold(5));
        assert!(s.notify.triggers.rule(TriggerKey::Critical).force_stop);
    }

    #[test]
    fn monitored_nodes_default_to_all() {
        let s = parse_toml(
            r#"
            [[nodes]]
            address = "a:1"
            [[nodes]]
            address = "b:2"
            "#,
        )
        .unwrap();
        assert_eq!(s.poll.monitored_indices(&s.registry()), vec![1, 2]);
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut s = Settings::default();
        s.nodes.clear();
        assert_eq!(s.validate(), Err(ConfigError::NoNodes));

        let mut s = Settings::default();
        s.nodes[0].username = Some("u".into());
        assert_eq!(s.validate(), Err(ConfigError::IncompleteAuth { index: 1 }));

        let mut s = Settings::default();
        s.nodes[0].address = "".into();
        assert!(matches!(s.validate(), Err(ConfigError::InvalidAddress { .. })));

        let mut s = Settings::default();
        s.notify.working_days = vec![0];
        assert_eq!(s.validate(), Err(ConfigError::InvalidDay(0)));

        let mut s = Settings::default();
        s.notify.working_hours = vec![24];
        assert_eq!(s.validate(), Err(ConfigError::InvalidHour(24)));

        let mut s = Settings::default();
        s.poll.round_interval_secs = 0;
        assert_eq!(s.validate(), Err(ConfigError::Zero("poll.round_interval_secs")));

        let mut s = Settings::default();
        s.poll.monitored_nodes = vec![3];
        assert_eq!(
            s.validate(),
            Err(ConfigError::UnknownMonitoredNode { index: 3, count: 1 })
        );

        let mut s = Settings::default();
        s.dashboard.enable_auth = true;
        assert_eq!(s.validate(), Err(ConfigError::DashboardAuth));
    }

    #[test]
    fn unknown_jobs_style_is_rejected() {
        assert!(parse_toml("[dashboard]\njobs_style = \"redis\"").is_err());
    }

    #[test]
    fn load_reads_file_and_falls_back_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert_eq!(load(&missing).unwrap().nodes.len(), 1);

        let path = dir.path().join("crawldeck.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[[nodes]]\naddress = \"192.168.1.5:6800\"").unwrap();
        let s = load(&path).unwrap();
        assert_eq!(s.nodes[0].address, "192.168.1.5:6800");
    }

    #[test]
    fn load_reports_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[poll]\nround_interval_secs = 0\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("round_interval_secs"));
    }
}
