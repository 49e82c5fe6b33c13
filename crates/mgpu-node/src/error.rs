//! Error types for the node agent's subsystems.

use thiserror::Error;

/// GPU inventory probing failures.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The probe command itself could not be run, or exited non-zero.
    #[error("gpu inventory probe failed: {0}")]
    Probe(String),
    /// The probe ran but its output could not be parsed.
    #[error("failed to parse gpu inventory output: {0}")]
    Parse(String),
}

/// GPU reservation bookkeeping failures.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// One or more requested indices are unknown or already reserved.
    #[error("gpu indices not available: {0:?}")]
    Unavailable(Vec<u32>),
}

/// Job process supervision failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The job's process could not be spawned.
    #[error("failed to spawn job process: {0}")]
    Spawn(String),
    /// The job's process group could not be signaled.
    #[error("failed to signal job process group: {0}")]
    Kill(String),
}

/// Top-level agent error, covering both local subsystems and RPCs to
/// the master.
#[derive(Debug, Error)]
pub enum AgentError {
    /// GPU inventory error.
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    /// GPU allocator error.
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    /// Process supervision error.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    /// I/O error while talking to the master.
    #[error("i/o error talking to master: {0}")]
    Io(#[from] std::io::Error),
    /// Wire-protocol error while talking to the master.
    #[error("protocol error talking to master: {0}")]
    Proto(#[from] mgpu_proto::ProtoError),
    /// The master responded with an error status.
    #[error("master rejected request: {0}")]
    MasterRejected(String),
    /// The master closed the connection before sending an acknowledgement.
    #[error("master closed the connection before acknowledging")]
    MasterUnreachable,
}

/// Node configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read node config {path}: {source}")]
    Read {
        /// The path that failed to read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file's contents were not valid JSON for `NodeConfig`.
    #[error("failed to parse node config {path}: {source}")]
    Parse {
        /// The path that failed to parse.
        path: String,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}
