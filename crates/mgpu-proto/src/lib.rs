//! Wire protocol for the cluster GPU job scheduler.
//!
//! Shared by the `mgpu-master` and `mgpu-node` crates: identifiers and
//! value types ([`types`]), request/response/event message shapes
//! ([`messages`]), the newline-delimited JSON framing used on every TCP
//! connection ([`wire`]), and the error type both sides parse into
//! ([`error`]).

#![forbid(unsafe_code)]

pub mod error;
pub mod messages;
pub mod types;
pub mod wire;

pub use error::ProtoError;
pub use messages::{
    AckResponse, AgentResponse, AgentResponseDetail, AgentToMaster, ClientRequest,
    ClientResponse, ClientResponseDetail, JobSummary, MasterToAgent, NodeStatus, StreamEvent,
    parse_client_request,
};
pub use types::{DistributedType, GpuInventoryEntry, JobId, JobState, NodeId, ResourceRequest};
pub use wire::{READ_BUFFER_LIMIT, read_json_line, write_json_line};
