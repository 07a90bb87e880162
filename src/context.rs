//! Per-request context for node-scoped dashboard routes.
//!
//! Built once per inbound request from the path's node index, the
//! `User-Agent` header and the `ui` query parameter. The node index is the
//! only input that can fail; the user agent only selects a display variant.

use serde::Serialize;
use thiserror::Error;

use crate::registry::{NodeConfig, Registry, RegistryError};

// Matched against the lowercased user agent.
const MOBILE_TOKENS: [&str; 8] = [
    "android",
    "webos",
    "ipad",
    "iphone",
    "ipod",
    "blackberry",
    "iemobile",
    "opera mini",
];

/// Internet Explorer announces itself as `MSIE` up to 10 and `Trident` in 11.
const IE_EDGE_TOKENS: [&str; 3] = ["edge", "msie", "trident"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid node selection '{0}'")]
    Selection(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClientKind {
    pub mobile: bool,
    pub ipad: bool,
    pub edge: bool,
}

impl ClientKind {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        ClientKind {
            mobile: MOBILE_TOKENS.iter().any(|t| ua.contains(t)),
            ipad: ua.contains("ipad"),
            edge: IE_EDGE_TOKENS.iter().any(|t| ua.contains(t)),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestContext {
    pub node: NodeConfig,
    pub node_count: usize,
    pub client: ClientKind,
    /// `?ui=mobile` was requested.
    pub ui_mobile: bool,
}

impl RequestContext {
    pub fn new(
        registry: &Registry,
        node: usize,
        user_agent: Option<&str>,
        ui: Option<&str>,
    ) -> Result<Self, RegistryError> {
        let node = registry.resolve(node)?.clone();
        Ok(RequestContext {
            node,
            node_count: registry.len(),
            client: ClientKind::from_user_agent(user_agent.unwrap_or_default()),
            ui_mobile: ui == Some("mobile"),
        })
    }
}

/// Node indices checked in a submitted form: fields named after the index
/// with the value `on`. Returned sorted and deduplicated.
pub fn selected_nodes<'a, I>(form: I, registry: &Registry) -> Result<Vec<usize>, ContextError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Vec::new();
    for (name, value) in form {
        if value != "on" {
            continue;
        }
        let Ok(index) = name.parse::<usize>() else {
            continue;
        };
        registry.resolve(index)?;
        out.push(index);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Parse a `nodes=1,3` query value. An absent or blank value selects every
/// node. Order is preserved.
pub fn parse_node_list(raw: Option<&str>, registry: &Registry) -> Result<Vec<usize>, ContextError> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(registry.indices()),
        Some(r) => r,
    };
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let index = part
            .parse::<usize>()
            .map_err(|_| ContextError::Selection(raw.to_string()))?;
        registry.resolve(index)?;
        out.push(index);
    }
    Ok(out)
}
