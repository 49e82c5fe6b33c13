//! The node agent's in-memory state: its GPU allocator and running-job
//! table, plus the short-lived RPC calls it makes back to the master.

use std::collections::HashMap;

use mgpu_proto::{read_json_line, write_json_line, AckResponse, AgentToMaster, JobId};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use crate::allocator::GpuAllocator;
use crate::config::NodeConfig;
use crate::error::AgentError;
use crate::inventory::GpuProbe;

/// One job currently executing on this node.
#[derive(Debug, Clone)]
pub struct RunningJob {
    /// GPU indices reserved for this job.
    pub gpus: Vec<u32>,
    /// OS pid of the job's process, and of its process group.
    pub pid: u32,
}

/// State guarded by the agent's single lock.
#[derive(Debug, Default)]
pub struct AgentState {
    /// The node's GPU reservation table.
    pub allocator: GpuAllocator,
    /// Jobs currently running, by id.
    pub running: HashMap<JobId, RunningJob>,
}

/// One node agent: its configuration, local state, and the means to
/// call back to the master.
pub struct Agent {
    /// This agent's configuration.
    pub config: NodeConfig,
    /// GPU and job bookkeeping, behind one lock.
    pub state: Mutex<AgentState>,
}

impl Agent {
    /// Build an agent, probing the node's GPUs to seed its allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the GPU probe fails.
    pub fn new(config: NodeConfig, probe: &dyn GpuProbe) -> Result<Self, AgentError> {
        let entries = probe.probe()?;
        let total: Vec<u32> = entries.iter().map(|e| e.index).collect();
        let available = crate::inventory::initially_available(
            &entries,
            config.gpu_utilization_threshold_percent,
        );
        let allocator = GpuAllocator::new(total, available);
        Ok(Self {
            config,
            state: Mutex::new(AgentState {
                allocator,
                running: HashMap::new(),
            }),
        })
    }

    /// GPU indices currently free.
    pub async fn available_gpus(&self) -> Vec<u32> {
        self.state.lock().await.allocator.available()
    }

    /// Total GPU count on the node.
    pub async fn gpu_count(&self) -> u32 {
        self.state.lock().await.allocator.total_count()
    }

    /// Reserve GPUs ahead of spawning a job.
    ///
    /// # Errors
    ///
    /// Returns an error if any requested index is already reserved.
    pub async fn reserve(&self, gpus: &[u32]) -> Result<(), AgentError> {
        self.state
            .lock()
            .await
            .allocator
            .reserve(gpus)
            .map_err(AgentError::from)
    }

    /// Undo a reservation without ever having recorded the job as
    /// running, e.g. when spawning its process failed.
    pub async fn release_reservation(&self, gpus: &[u32]) {
        self.state.lock().await.allocator.release(gpus);
    }

    /// Record a freshly spawned job as running.
    pub async fn record_running(&self, job_id: JobId, gpus: Vec<u32>, pid: u32) {
        self.state
            .lock()
            .await
            .running
            .insert(job_id, RunningJob { gpus, pid });
    }

    /// The pid of a running job's process group, for cancellation.
    pub async fn running_pid(&self, job_id: JobId) -> Option<u32> {
        self.state.lock().await.running.get(&job_id).map(|j| j.pid)
    }

    /// Finalize a job on process exit: release its GPUs, remove it from
    /// the running table, and report completion to the master.
    pub async fn finish_job(&self, job_id: JobId, exit_code: i32) {
        let gpus = {
            let mut state = self.state.lock().await;
            state.running.remove(&job_id).map(|j| j.gpus)
        };
        if let Some(gpus) = gpus {
            self.state.lock().await.allocator.release(&gpus);
        }
        if let Err(e) = self.report_complete(job_id, exit_code).await {
            warn!(job_id = %job_id, error = %e, "failed to report job completion to master");
        }
    }

    /// Forward one captured output line to the master.
    ///
    /// # Errors
    ///
    /// Returns an error if the master cannot be reached or rejects the
    /// message.
    pub async fn send_output(
        &self,
        job_id: JobId,
        data: String,
        interactive: bool,
    ) -> Result<(), AgentError> {
        let msg = AgentToMaster::JobOutput {
            job_id: job_id.to_string(),
            data,
            interactive,
            node_id: self.config.node_id.clone(),
        };
        self.call_master(&msg).await
    }

    async fn report_complete(&self, job_id: JobId, exit_code: i32) -> Result<(), AgentError> {
        let msg = AgentToMaster::JobComplete {
            job_id: job_id.to_string(),
            exit_code,
            node_id: self.config.node_id.clone(),
        };
        self.call_master(&msg).await
    }

    /// Register with the master, advertising the port this agent's
    /// listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the master cannot be reached or rejects the
    /// registration.
    pub async fn register(&self, listen_port: u16) -> Result<(), AgentError> {
        let gpu_count = self.gpu_count().await;
        let msg = AgentToMaster::NodeRegister {
            node_id: self.config.node_id.clone(),
            host: self.config.advertise_host.clone(),
            port: listen_port,
            gpu_count,
            gpu_info: None,
        };
        self.call_master(&msg).await
    }

    /// Send one heartbeat reporting current availability and running jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the master cannot be reached or rejects the
    /// heartbeat.
    pub async fn heartbeat(&self) -> Result<(), AgentError> {
        let (available_gpus, running_jobs) = {
            let state = self.state.lock().await;
            (
                state.allocator.available(),
                state.running.keys().map(ToString::to_string).collect(),
            )
        };
        let msg = AgentToMaster::NodeHeartbeat {
            node_id: self.config.node_id.clone(),
            available_gpus,
            running_jobs,
        };
        self.call_master(&msg).await
    }

    /// Open a short-lived connection to the master and send one
    /// fire-and-forget message, rather than holding a persistent link.
    async fn call_master(&self, msg: &AgentToMaster) -> Result<(), AgentError> {
        let stream = TcpStream::connect((self.config.master_host.as_str(), self.config.master_port))
            .await?;
        let (read_half, mut write_half) = stream.into_split();
        write_json_line(&mut write_half, msg).await?;
        let mut reader = BufReader::new(read_half);
        let ack: Option<AckResponse> = read_json_line(&mut reader).await?;
        match ack {
            Some(ack) if ack.status == "ok" => Ok(()),
            Some(ack) => Err(AgentError::MasterRejected(
                ack.message.unwrap_or_default(),
            )),
            None => Err(AgentError::MasterUnreachable),
        }
    }
}
