//! Core identifiers and value types shared by master and agent.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Unique identifier for a job, an 8-character uppercase hex string.
///
/// Assigned by the master at accept time and unique for the master's
/// lifetime. Short and human-typeable rather than a full UUID, matching
/// the scheduler this system replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId([u8; 8]);

impl JobId {
    /// Generate a new random job id.
    #[must_use]
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 8];
        const ALPHABET: &[u8] = b"0123456789ABCDEF";
        for b in &mut bytes {
            *b = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        Self(bytes)
    }

    /// Parse a job id from its 8-character string form.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not exactly 8 ASCII hex characters.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let bytes = s.as_bytes();
        if bytes.len() != 8 || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(ProtoError::Validation(format!("invalid job id: {s}")));
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        arr.make_ascii_uppercase();
        Ok(Self(arr))
    }

    /// Return the id as a `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????????")
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Operator-assigned identifier for a compute node.
///
/// Unlike `JobId` this is an arbitrary string chosen by the cluster
/// operator in the cluster config file and echoed back by the agent on
/// registration — not generated by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an operator-provided node id string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the node id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for a placement.
    Queued,
    /// Dispatched to a node and executing.
    Running,
    /// Exited with code 0.
    Completed,
    /// Exited non-zero, or dispatch/placement retries were exhausted.
    Failed,
    /// Cancelled by operator request.
    Cancelled,
    /// Not a real job state — reported by `get_job_output` for an id
    /// this master has never accepted, per the uniform `ok` + `unknown`
    /// convention preferred for polling clients.
    Unknown,
}

impl JobState {
    /// Whether this state is final — no further transitions occur.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// The shape of a job's GPU resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ResourceRequest {
    /// Exact node → GPU-index mapping. Honored all-or-nothing, no fallback.
    Pinned {
        /// Requested placement.
        assignment: HashMap<NodeId, Vec<u32>>,
    },
    /// `node_count` nodes each contributing `gpus_per_node` GPUs.
    Shaped {
        /// How many distinct nodes the job needs.
        node_count: u32,
        /// GPUs required on each of those nodes.
        gpus_per_node: u32,
        /// If set, only these nodes are eligible.
        include: Option<Vec<NodeId>>,
        /// If set, these nodes are never eligible.
        exclude: Option<Vec<NodeId>>,
    },
    /// A single node with at least this many free GPUs.
    Flat {
        /// Number of GPUs the job needs, on one node.
        gpus_needed: u32,
    },
}

impl ResourceRequest {
    /// Total number of GPUs this request ultimately needs, for logging
    /// and diagnostics (not used for placement itself).
    #[must_use]
    pub fn total_gpus(&self) -> u64 {
        match self {
            Self::Pinned { assignment } => {
                assignment.values().map(|v| v.len() as u64).sum()
            }
            Self::Shaped {
                node_count,
                gpus_per_node,
                ..
            } => u64::from(*node_count) * u64::from(*gpus_per_node),
            Self::Flat { gpus_needed } => u64::from(*gpus_needed),
        }
    }
}

/// Distributed-rendezvous framework a multi-host job expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedType {
    /// No multi-host rendezvous; the job runs on exactly one node.
    Single,
    /// `mpirun`-style launch; the agent adds no rendezvous variables.
    Mpi,
    /// `torch.distributed`-style launch; the agent sets `RANK`,
    /// `WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT`.
    Pytorch,
}

/// One GPU as reported by the inventory probe on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInventoryEntry {
    /// GPU index as seen by the local driver.
    pub index: u32,
    /// Human-readable GPU model name.
    pub name: String,
    /// Total device memory, in MiB.
    pub memory_total_mib: u64,
    /// Memory currently in use, in MiB.
    pub memory_used_mib: u64,
}

impl GpuInventoryEntry {
    /// Fraction of total memory currently in use, in `[0.0, 1.0]`.
    #[must_use]
    pub fn utilization_fraction(&self) -> f64 {
        if self.memory_total_mib == 0 {
            return 0.0;
        }
        self.memory_used_mib as f64 / self.memory_total_mib as f64
    }
}
