//! Error types for the master's subsystems, one enum per module as the
//! rest of this workspace does (`claw-gateway`, `claw-proto`) rather
//! than a single catch-all type.

use thiserror::Error;

/// Errors from job queue and lifecycle operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No job with the given id is known to the master.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The job exists but is not in a state the requested operation allows.
    #[error("job {job_id} is already terminal ({state})")]
    AlreadyTerminal {
        /// The job's id.
        job_id: String,
        /// Its current state.
        state: String,
    },
}

/// Errors from the node registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A referenced node id is not registered.
    #[error("node not found: {0}")]
    NotFound(String),

    /// A node lacks the requested GPU indices in its available set.
    #[error("node {node_id} missing GPU indices: {missing:?}")]
    MissingGpus {
        /// The node that was checked.
        node_id: String,
        /// The requested indices it did not have free.
        missing: Vec<u32>,
    },
}

/// Errors from dispatching an RPC to a node agent.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The RPC could not be completed before its deadline.
    #[error("rpc to {node_id} timed out after {deadline_secs}s")]
    Timeout {
        /// The target node.
        node_id: String,
        /// The configured deadline.
        deadline_secs: u64,
    },

    /// A transport-level failure (connect or I/O) occurred.
    #[error("rpc to {node_id} failed: {source}")]
    Transport {
        /// The target node.
        node_id: String,
        /// The underlying protocol error.
        #[source]
        source: mgpu_proto::ProtoError,
    },

    /// The agent returned `{"status":"error"}`.
    #[error("agent {node_id} rejected request: {message}")]
    Rejected {
        /// The target node.
        node_id: String,
        /// The agent's error message.
        message: String,
    },
}

/// Errors surfaced while loading the cluster configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read cluster config {path}: {source}")]
    Read {
        /// The path that was attempted.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file's contents were not valid YAML for the config schema.
    #[error("failed to parse cluster config {path}: {source}")]
    Parse {
        /// The path that was attempted.
        path: String,
        /// The underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },
}
