//! The cluster config file: a YAML list of nodes, loaded once at master
//! startup. Optional — a default single-node localhost entry is used
//! when no path is given.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One statically-configured node entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigEntry {
    /// Operator-assigned node id.
    pub node_id: String,
    /// Informational hostname, used to build `MASTER_ADDR` for the
    /// rank-0 node of a distributed job.
    pub hostname: String,
    /// IP address the master dials to reach this node's agent.
    pub ip: String,
    /// TCP port the agent listens on.
    pub port: u16,
    /// Total GPU count, informational until the agent's own
    /// `node_register` is received (the registry's authoritative count
    /// comes from the agent, not this file).
    pub gpu_count: u32,
    /// Informational GPU model name.
    #[serde(default)]
    pub gpu_type: Option<String>,
}

/// The full cluster config file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Statically known nodes. The master accepts `node_register` from
    /// agents regardless of whether they appear here — this list exists
    /// for operator documentation and the distributed-job `MASTER_ADDR`
    /// hostname lookup, not as an access-control allowlist.
    #[serde(default)]
    pub nodes: Vec<NodeConfigEntry>,
}

impl ClusterConfig {
    /// Load a cluster config from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read or
    /// [`ConfigError::Parse`] if its contents are not valid YAML for
    /// this schema.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// The default single-node localhost entry used when no config file
    /// is given.
    #[must_use]
    pub fn default_single_node() -> Self {
        Self {
            nodes: vec![NodeConfigEntry {
                node_id: "localhost".to_string(),
                hostname: "localhost".to_string(),
                ip: "127.0.0.1".to_string(),
                port: 9600,
                gpu_count: 0,
                gpu_type: None,
            }],
        }
    }

    /// Look up a node's hostname by id, for `MASTER_ADDR` construction.
    #[must_use]
    pub fn hostname_of(&self, node_id: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .map(|n| n.hostname.as_str())
    }
}
