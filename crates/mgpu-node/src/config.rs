//! Node agent configuration: the file format, its defaults, and the CLI
//! overrides layered on top of it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Percentage of GPU memory in use below which a GPU is considered free
/// at agent startup.
pub const DEFAULT_UTILIZATION_THRESHOLD_PERCENT: f64 = 10.0;

/// Seconds between heartbeats sent to the master.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_master_host() -> String {
    "127.0.0.1".to_string()
}

fn default_master_port() -> u16 {
    9500
}

fn default_utilization_threshold() -> f64 {
    DEFAULT_UTILIZATION_THRESHOLD_PERCENT
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

/// Per-node agent configuration, loadable from a JSON file and then
/// overridden field-by-field by CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Operator-assigned node id, echoed to the master on registration.
    #[serde(default)]
    pub node_id: String,
    /// Hostname or IP the master should dial to reach this agent.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// The master's hostname or IP.
    #[serde(default = "default_master_host")]
    pub master_host: String,
    /// The master's TCP port.
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    /// GPU memory-utilization percentage below which a GPU counts as
    /// free when the agent starts up.
    #[serde(default = "default_utilization_threshold")]
    pub gpu_utilization_threshold_percent: f64,
    /// Seconds between heartbeats sent to the master.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            advertise_host: default_advertise_host(),
            master_host: default_master_host(),
            master_port: default_master_port(),
            gpu_utilization_threshold_percent: default_utilization_threshold(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl NodeConfig {
    /// Load a node config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read or
    /// [`ConfigError::Parse`] if its contents are not valid JSON for
    /// this schema.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_node_id() {
        let config = NodeConfig::default();
        assert!(config.node_id.is_empty());
        assert_eq!(config.master_port, 9500);
        assert!((config.gpu_utilization_threshold_percent - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.heartbeat_interval_secs, 10);
    }

    #[test]
    fn loads_a_well_formed_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"node_id":"n1","master_host":"10.0.0.1","master_port":9500}"#,
        )
        .expect("write");
        let config = NodeConfig::load(&path).expect("load");
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.master_host, "10.0.0.1");
        // Fields absent from the file fall back to their defaults.
        assert_eq!(config.heartbeat_interval_secs, 10);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = NodeConfig::load("/nonexistent/node.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.json");
        std::fs::write(&path, "{not valid json").expect("write");
        let err = NodeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
