//! # Registry — Static Node Directory
//!
//! Holds the ordered list of crawl nodes the dashboard fronts. A node is
//! addressed by its 1-based position in the configuration, and that index is
//! stable for the lifetime of the process: the registry is built once at
//! startup and never mutated afterwards.
//!
//! | Lookup | Returns |
//! |--------|---------|
//! | `resolve(i)` | full `NodeConfig` |
//! | `group_of(i)` | group label (may be empty) |
//! | `auth_of(i)` | optional basic-auth pair |
//!
//! Every lookup fails with `RegistryError::OutOfRange` when `i` is outside
//! `1..=N`. That error is the only one that aborts a request outright.

use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node index error: {index}, which should be between 1 and {count}")]
    OutOfRange { index: usize, count: usize },
}

/// Basic-auth credentials for one node. The password never leaves the
/// process through serialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAuth {
    pub username: String,
    pub password: String,
}

impl Serialize for NodeAuth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.username)?;
        tup.serialize_element("******")?;
        tup.end()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub index: usize,
    pub address: String,
    pub group: String,
    pub auth: Option<NodeAuth>,
}

impl NodeConfig {
    /// Base URL of the node's HTTP API, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address.trim_end_matches('/'))
    }

    /// Absolute URL for an API path such as `daemonstatus.json`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }
}

/// Input record used to build a registry, one per configured node.
#[derive(Clone, Debug, Default)]
pub struct NodeSpec {
    pub address: String,
    pub group: String,
    pub auth: Option<NodeAuth>,
}

#[derive(Clone, Debug)]
pub struct Registry {
    nodes: Vec<NodeConfig>,
}

impl Registry {
    pub fn new(specs: Vec<NodeSpec>) -> Self {
        let nodes = specs
            .into_iter()
            .enumerate()
            .map(|(i, s)| NodeConfig {
                index: i + 1,
                address: s.address,
                group: s.group,
                auth: s.auth,
            })
            .collect();
        Registry { nodes }
    }

    /// Convenience constructor for address-only clusters.
    pub fn from_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            addresses
                .into_iter()
                .map(|a| NodeSpec {
                    address: a.into(),
                    ..NodeSpec::default()
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn resolve(&self, index: usize) -> Result<&NodeConfig, RegistryError> {
        if index == 0 || index > self.nodes.len() {
            return Err(RegistryError::OutOfRange {
                index,
                count: self.nodes.len(),
            });
        }
        Ok(&self.nodes[index - 1])
    }

    pub fn group_of(&self, index: usize) -> Result<&str, RegistryError> {
        self.resolve(index).map(|n| n.group.as_str())
    }

    pub fn auth_of(&self, index: usize) -> Result<Option<&NodeAuth>, RegistryError> {
        self.resolve(index).map(|n| n.auth.as_ref())
    }

    pub fn indices(&self) -> Vec<usize> {
        (1..=self.nodes.len()).collect()
    }

    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    pub fn any_requires_auth(&self) -> bool {
        self.nodes.iter().any(|n| n.auth.is_some())
    }
}
