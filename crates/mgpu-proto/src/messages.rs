//! Request, response, and event message shapes exchanged between
//! clients, the master, and node agents.
//!
//! Messages are tagged JSON objects (`{"cmd": "...", ...}` for requests,
//! `{"status": "ok"|"error", ...}` for responses), matching the client
//! front-end's existing wire shape rather than this codebase's `tag`
//! envelope used elsewhere (`claw-proto::GatewayMessage`), since the
//! two protocols are independent and this one predates the gateway.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{DistributedType, GpuInventoryEntry, JobId, JobState, NodeId, ResourceRequest};

/// A request sent by a submission client to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Submit a new job.
    Submit {
        /// OS identity the job's process runs as.
        user: String,
        /// Shell command line to execute.
        command: String,
        /// GPUs requested, in flat-count form.
        #[serde(default)]
        gpus: Option<u32>,
        /// GPUs requested, in pinned node→indices form.
        #[serde(default)]
        node_gpu_ids: Option<HashMap<NodeId, Vec<u32>>>,
        /// Distinct node count for a shaped request.
        #[serde(default)]
        node_count: Option<u32>,
        /// GPUs per node for a shaped request.
        #[serde(default)]
        gpus_per_node: Option<u32>,
        /// Node allowlist for a shaped request.
        #[serde(default)]
        include_nodes: Option<Vec<NodeId>>,
        /// Node denylist for a shaped request.
        #[serde(default)]
        exclude_nodes: Option<Vec<NodeId>>,
        /// Queue priority; larger runs earlier. Defaults to 0.
        #[serde(default)]
        priority: Option<i64>,
        /// Whether the submitting socket should be retained as an
        /// output sink.
        #[serde(default)]
        interactive: Option<bool>,
        /// Distributed rendezvous shape; defaults to `single`.
        #[serde(default)]
        distributed_type: Option<DistributedType>,
    },
    /// List queued/running jobs and node status.
    Queue {},
    /// Cancel a queued or running job.
    Cancel {
        /// The job to cancel.
        job_id: String,
    },
    /// Cancel every queued and running job.
    Flush {},
    /// Fetch buffered output for a job, from a given line offset.
    GetJobOutput {
        /// The job whose output is requested.
        job_id: String,
        /// First output line index to return (0-based).
        #[serde(default)]
        from_line: usize,
    },
}

/// A status snapshot of one queued or running job, as returned by `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// The job's id.
    pub job_id: String,
    /// Submitting user.
    pub user: String,
    /// Command line.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Queue priority.
    pub priority: i64,
    /// Assigned node, if placed.
    pub node_id: Option<String>,
    /// Assigned GPU indices, if placed.
    pub gpus: Vec<u32>,
}

/// Per-node status, as returned by `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// GPU indices the node currently reports as free.
    pub available_gpus: Vec<u32>,
    /// Jobs currently running on the node.
    pub running_jobs: Vec<String>,
    /// Seconds since the node's last processed heartbeat.
    pub last_heartbeat_secs_ago: f64,
}

/// The master's response to a `ClientRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClientResponse {
    /// Successful response. `detail` carries the command-specific payload.
    Ok(#[serde(flatten)] ClientResponseDetail),
    /// A validation or not-found error.
    Error {
        /// Human-readable error description.
        message: String,
    },
}

/// The command-specific payload of a successful [`ClientResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientResponseDetail {
    /// Response to `submit`.
    Submitted {
        /// The id assigned to the new job.
        job_id: String,
        /// Present and `true` only for interactive submissions, signaling
        /// the client that its socket will now receive streamed events.
        #[serde(skip_serializing_if = "Option::is_none")]
        interactive: Option<bool>,
    },
    /// Response to `queue`.
    Queue {
        /// Queued jobs, in scheduling order.
        queue: Vec<JobSummary>,
        /// Running jobs.
        running: Vec<JobSummary>,
        /// Registered nodes by id.
        nodes: HashMap<String, NodeStatus>,
    },
    /// Response to `get_job_output`.
    JobOutput {
        /// The job's current lifecycle state, or `unknown` if the id was
        /// never accepted.
        job_status: JobState,
        /// Output lines from `from_line` onward.
        output: Vec<String>,
        /// Terminal exit code, if the job has finished.
        exit_code: Option<i32>,
    },
    /// Response to `cancel` / `flush`.
    Message {
        /// Human-readable confirmation.
        message: String,
    },
}

impl ClientResponse {
    /// Build an error response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// A message sent by a node agent to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AgentToMaster {
    /// First contact from a newly started agent.
    NodeRegister {
        /// Operator-assigned node id.
        node_id: String,
        /// Hostname or IP the master should dial for RPCs.
        host: String,
        /// TCP port the agent listens on.
        port: u16,
        /// Total GPU count on the node.
        gpu_count: u32,
        /// Detailed per-GPU inventory, if available.
        #[serde(default)]
        gpu_info: Option<Vec<GpuInventoryEntry>>,
    },
    /// Periodic liveness and availability report.
    NodeHeartbeat {
        /// The reporting node.
        node_id: String,
        /// GPU indices the agent currently considers free.
        available_gpus: Vec<u32>,
        /// Job ids the agent currently has running.
        running_jobs: Vec<String>,
    },
    /// One line of captured job output.
    JobOutput {
        /// The job the output belongs to.
        job_id: String,
        /// The captured line, without its trailing newline.
        data: String,
        /// Whether this job has interactive attachments to forward to.
        interactive: bool,
        /// The node that produced it.
        node_id: String,
    },
    /// Terminal notification that a job's process has exited.
    JobComplete {
        /// The job that finished.
        job_id: String,
        /// The process's exit code.
        exit_code: i32,
        /// The node that ran it.
        node_id: String,
    },
}

/// The master's response to an [`AgentToMaster`] message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AckResponse {
    /// `"ok"` or `"error"`.
    pub status: String,
    /// Present only when `status` is `"error"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AckResponse {
    /// An `{"status":"ok"}` acknowledgement.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            message: None,
        }
    }

    /// An `{"status":"error","message":...}` acknowledgement.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }
}

/// A request sent by the master to a node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MasterToAgent {
    /// Launch a job on the agent's node.
    Run {
        /// The job to run.
        job_id: String,
        /// Shell command line.
        command: String,
        /// Submitting user identity.
        user: String,
        /// GPU indices reserved for this job on this node.
        gpus: Vec<u32>,
        /// Whether output should also be forwarded live.
        interactive: bool,
        /// Rendezvous rank, for multi-host jobs.
        #[serde(default)]
        rank: Option<u32>,
        /// Rendezvous world size, for multi-host jobs.
        #[serde(default)]
        world_size: Option<u32>,
        /// Hostname of the rank-0 node, for multi-host jobs.
        #[serde(default)]
        master_node: Option<String>,
        /// Rendezvous framework in use.
        #[serde(default)]
        distributed_type: Option<DistributedType>,
    },
    /// Cancel a running job.
    Cancel {
        /// The job to cancel.
        job_id: String,
    },
    /// Ask the agent for its current resource view.
    GetResources {},
}

/// The agent's response to a [`MasterToAgent`] request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResponse {
    /// Successful response.
    Ok(#[serde(flatten)] AgentResponseDetail),
    /// The agent rejected or failed to service the request.
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// The command-specific payload of a successful [`AgentResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentResponseDetail {
    /// Response to `get_resources`.
    Resources {
        /// GPU indices currently free.
        available_gpus: Vec<u32>,
        /// Total GPU count on the node.
        gpu_count: u32,
    },
    /// Response to `run` / `cancel`.
    Message {
        /// Human-readable confirmation.
        message: String,
    },
}

/// A single event in the interactive output stream (master→client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One line of job output.
    Output {
        /// The captured line.
        data: String,
    },
    /// The job has finished.
    Completion {
        /// Its terminal exit code.
        exit_code: i32,
    },
    /// Something went wrong before completion (e.g. dispatch failure).
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// Parse a raw client request, rejecting unknown `cmd` tags uniformly.
///
/// # Errors
///
/// Returns [`crate::error::ProtoError::Serialization`] if `raw` is not
/// valid JSON for any known request shape.
pub fn parse_client_request(raw: &str) -> Result<ClientRequest, crate::error::ProtoError> {
    serde_json::from_str(raw).map_err(Into::into)
}
