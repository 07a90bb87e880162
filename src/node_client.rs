//! # Node Client — Uniform Envelope Around Every Node Call
//!
//! Issues GET/POST requests to a crawl node's JSON or text API and folds every
//! possible outcome into an [`Envelope`]. Nothing raised by the transport or
//! by body decoding escapes `NodeClient::call`: callers branch on
//! [`EnvelopeKind`] instead of handling errors.
//!
//! ## Outcomes
//!
//! | Kind | `status_code` | `status` | Meaning |
//! |------|---------------|----------|---------|
//! | `Ok` | 200 | `ok` | decoded body, node reported success |
//! | `Transport` | -1 | `error` | connection refused, DNS, timeout |
//! | `Decode` | HTTP code | `error` | JSON expected, body was not JSON (e.g. a 502 HTML page while the node restarts) |
//! | `Remote` | HTTP code | `error`/`N/A` | decoded, but non-200 or status != ok |
//!
//! Every envelope is stamped with the resolved URL, the auth used and a
//! capture timestamp so results can be correlated after the fact.
//!
//! Backend nodes on different runtimes escape traceback newlines differently,
//! so a decoded `message` field has literal `\n` sequences turned into real
//! newlines. No call is retried here; retry policy belongs to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::prom_metrics;
use crate::registry::{NodeAuth, NodeConfig};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Sentinel status code for calls that never got an HTTP response.
pub const TRANSPORT_FAILURE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "N/A")]
    NotAvailable,
}

impl Status {
    fn from_field(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("ok") => Status::Ok,
            Some("error") => Status::Error,
            _ => Status::NotAvailable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::NotAvailable => "N/A",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Ok,
    #[serde(rename = "transport_error")]
    Transport,
    #[serde(rename = "decode_error")]
    Decode,
    #[serde(rename = "remote_error")]
    Remote,
}

impl EnvelopeKind {
    pub fn label(&self) -> &'static str {
        match self {
            EnvelopeKind::Ok => "ok",
            EnvelopeKind::Transport => "transport_error",
            EnvelopeKind::Decode => "decode_error",
            EnvelopeKind::Remote => "remote_error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Json(Value),
    Text(String),
    Empty,
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// What the caller wants back from the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Text,
}

/// One outbound call, built per request and owned by the caller.
#[derive(Clone, Debug)]
pub struct NodeRequest {
    pub node: usize,
    pub url: String,
    pub form: Option<Vec<(String, String)>>,
    pub auth: Option<NodeAuth>,
    pub timeout: Duration,
}

impl NodeRequest {
    pub fn get(node: &NodeConfig, path: &str) -> Self {
        NodeRequest {
            node: node.index,
            url: node.url(path),
            form: None,
            auth: node.auth.clone(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn post(node: &NodeConfig, path: &str, form: Vec<(String, String)>) -> Self {
        NodeRequest {
            form: Some(form),
            ..Self::get(node, path)
        }
    }

    /// Append a query pair, percent-encoding the value.
    pub fn query(mut self, key: &str, value: &str) -> Self {
        if let Ok(mut parsed) = url::Url::parse(&self.url) {
            parsed.query_pairs_mut().append_pair(key, value);
            self.url = parsed.to_string();
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn method(&self) -> &'static str {
        if self.form.is_some() {
            "POST"
        } else {
            "GET"
        }
    }
}

/// Normalized result of one node call.
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub node: usize,
    pub kind: EnvelopeKind,
    pub status_code: i32,
    pub status: Status,
    pub message: String,
    pub payload: Payload,
    pub url: String,
    pub auth: Option<NodeAuth>,
    pub when: String,
}

impl Envelope {
    pub fn is_ok(&self) -> bool {
        self.kind == EnvelopeKind::Ok
    }

    pub fn is_transport_failure(&self) -> bool {
        self.kind == EnvelopeKind::Transport
    }

    /// Look up a top-level field in a decoded JSON payload.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.as_json().and_then(|v| v.get(key))
    }

    /// Synthesize the envelope for a call that never produced a response.
    pub fn transport_failure(req: &NodeRequest, reason: &str) -> Self {
        let message = if reason.is_empty() {
            "transport error".to_string()
        } else {
            reason.to_string()
        };
        Envelope {
            node: req.node,
            kind: EnvelopeKind::Transport,
            status_code: TRANSPORT_FAILURE,
            status: Status::Error,
            message,
            payload: Payload::Empty,
            url: req.url.clone(),
            auth: req.auth.clone(),
            when: now_string(),
        }
    }

    /// Classify a received HTTP response body.
    pub fn from_body(
        req: &NodeRequest,
        status_code: i32,
        body: String,
        format: ResponseFormat,
    ) -> Self {
        let mut env = Envelope {
            node: req.node,
            kind: EnvelopeKind::Ok,
            status_code,
            status: Status::Ok,
            message: String::new(),
            payload: Payload::Empty,
            url: req.url.clone(),
            auth: req.auth.clone(),
            when: now_string(),
        };

        match format {
            ResponseFormat::Text => {
                if status_code != 200 {
                    env.kind = EnvelopeKind::Remote;
                    env.status = Status::Error;
                    env.message = body.clone();
                }
                env.payload = Payload::Text(body);
            }
            ResponseFormat::Json => match serde_json::from_str::<Value>(&body) {
                Ok(value) => {
                    env.status = Status::from_field(value.get("status"));
                    env.message = value
                        .get("message")
                        .and_then(Value::as_str)
                        .map(unescape_newlines)
                        .unwrap_or_default();
                    if status_code != 200 || env.status != Status::Ok {
                        env.kind = EnvelopeKind::Remote;
                    }
                    env.payload = Payload::Json(value);
                }
                Err(_) => {
                    env.kind = EnvelopeKind::Decode;
                    env.status = Status::Error;
                    env.message = body.clone();
                    env.payload = Payload::Text(body);
                }
            },
        }
        env
    }
}

/// Replace literal `\n` escape sequences with real newlines.
pub fn unescape_newlines(message: &str) -> String {
    message.replace("\\n", "\n")
}

pub(crate) fn now_string() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Head and tail of a long text body, for debug logging.
fn abbreviate(text: &str) -> String {
    let chars = text.chars().count();
    if chars <= 200 {
        return text.to_string();
    }
    let head: String = text.chars().take(100).collect();
    let tail: String = text.chars().skip(chars - 100).collect();
    format!("{}......{}", head, tail)
}

#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    metrics: Option<Arc<prom_metrics::Metrics>>,
}

impl NodeClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(NodeClient {
            http,
            metrics: None,
        })
    }

    /// Record every call outcome in the given registry.
    pub fn with_metrics(mut self, metrics: Arc<prom_metrics::Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn call(&self, req: &NodeRequest, format: ResponseFormat) -> Envelope {
        let env = self.execute(req, format).await;
        if let Some(m) = &self.metrics {
            m.node_requests
                .get_or_create(&prom_metrics::NodeLabel {
                    node: req.node.to_string(),
                    outcome: env.kind.label().to_string(),
                })
                .inc();
        }
        env
    }

    async fn execute(&self, req: &NodeRequest, format: ResponseFormat) -> Envelope {
        debug!(node = req.node, url = %req.url, method = req.method(), ">>>>> request");
        if let Some(form) = &req.form {
            debug!(node = req.node, ?form, "POST data");
        }

        let mut builder = match &req.form {
            Some(form) => self.http.post(&req.url).form(form),
            None => self.http.get(&req.url),
        };
        if let Some(auth) = &req.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = match builder.timeout(req.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                error!(node = req.node, url = %req.url, error = %e, "!!!!! request failed");
                return Envelope::transport_failure(req, &e.to_string());
            }
        };

        let status_code = i32::from(response.status().as_u16());
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                error!(node = req.node, url = %req.url, error = %e, "!!!!! failed to read body");
                return Envelope::transport_failure(req, &e.to_string());
            }
        };

        let env = Envelope::from_body(req, status_code, body, format);
        match env.kind {
            EnvelopeKind::Ok => match &env.payload {
                Payload::Text(text) => debug!(
                    node = req.node,
                    url = %req.url,
                    status_code,
                    body = %abbreviate(text),
                    "<<<<< response"
                ),
                _ => debug!(
                    node = req.node,
                    url = %req.url,
                    status_code,
                    status = env.status.as_str(),
                    "<<<<< response"
                ),
            },
            EnvelopeKind::Decode => warn!(
                node = req.node,
                url = %req.url,
                status_code,
                "!!!!! failed to decode json"
            ),
            _ => error!(
                node = req.node,
                url = %req.url,
                status_code,
                status = env.status.as_str(),
                "!!!!! remote error"
            ),
        }
        env
    }

    /// Relay a stop command for one job. `force` sends it a second time,
    /// which tells Scrapyd to skip the graceful shutdown.
    pub async fn stop_job(
        &self,
        node: &NodeConfig,
        project: &str,
        job: &str,
        force: bool,
        timeout: Duration,
    ) -> Envelope {
        let form = vec![
            ("project".to_string(), project.to_string()),
            ("job".to_string(), job.to_string()),
        ];
        let req = NodeRequest::post(node, "stop.json", form).timeout(timeout);
        let first = self.call(&req, ResponseFormat::Json).await;
        if !force || !first.is_ok() {
            return first;
        }
        self.call(&req, ResponseFormat::Json).await
    }
}
