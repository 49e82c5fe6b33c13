//! The `Master` value: owns every piece of mutable scheduler state
//! behind one lock, replacing the original scheduler's module-level
//! mutable singletons with an explicit value tests can construct
//! fresh per case.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use mgpu_proto::{
    ClientResponseDetail, JobId, JobState, JobSummary, NodeStatus, ResourceRequest,
};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::attachments::AttachmentTable;
use crate::config::ClusterConfig;
use crate::error::SchedulerError;
use crate::job::Job;
use crate::output::OutputStore;
use crate::queue::JobQueue;
use crate::registry::NodeRegistry;

/// Everything the scheduling loop, monitor, and request handlers share.
#[derive(Default)]
pub struct MasterState {
    /// Not-yet-running jobs, in scheduling order.
    pub queue: JobQueue,
    /// Jobs currently dispatched to an agent.
    pub running: HashMap<JobId, Job>,
    /// Terminal jobs, retained for the master's lifetime.
    pub completed: HashMap<JobId, Job>,
    /// Registered compute nodes.
    pub registry: NodeRegistry,
    /// Per-job output line buffers.
    pub output: OutputStore,
    /// Interactive client sockets, by job id.
    pub attachments: AttachmentTable,
}

impl MasterState {
    fn find_any(&self, id: JobId) -> Option<&Job> {
        self.queue
            .find(id)
            .map(|(_, j)| j)
            .or_else(|| self.running.get(&id))
            .or_else(|| self.completed.get(&id))
    }

    /// Finalize a job as failed, cancelled, or completed, moving it into
    /// the completed map, releasing any GPUs it held, and closing its
    /// interactive attachments with a `completion` event.
    pub async fn finalize(&mut self, job: Job, state: JobState, exit_code: i32, extra_output: Vec<String>) {
        self.finalize_inner(job, state, exit_code, extra_output, None).await;
    }

    /// Finalize a job that never ran to completion because of an
    /// infrastructure failure (dispatch retries exhausted, no placement
    /// ever found, or the node it was running on died) rather than the
    /// user's own process exiting. Interactive attachments are closed
    /// with an `error` event instead of `completion`, matching the
    /// "something went wrong before completion" case the wire protocol
    /// sets aside a distinct event for.
    pub async fn finalize_infra_failure(
        &mut self,
        job: Job,
        exit_code: i32,
        message: String,
        extra_output: Vec<String>,
    ) {
        self.finalize_inner(job, JobState::Failed, exit_code, extra_output, Some(message))
            .await;
    }

    async fn finalize_inner(
        &mut self,
        mut job: Job,
        state: JobState,
        exit_code: i32,
        extra_output: Vec<String>,
        infra_message: Option<String>,
    ) {
        debug_assert!(state.is_terminal());
        for (node_id, gpus) in job.assignment.clone() {
            self.registry.release(&node_id, &gpus, job.id.to_string().as_str());
        }
        job.finish(state, exit_code);
        if !extra_output.is_empty() {
            self.output.extend(job.id, extra_output);
        }
        match infra_message {
            Some(message) => self.attachments.fail(job.id, message).await,
            None => self.attachments.complete(job.id, exit_code).await,
        }
        self.completed.insert(job.id, job);
    }
}

/// The master's request-handling and scheduling facade.
pub struct Master {
    /// Cluster config, for `MASTER_ADDR` hostname lookups.
    pub config: ClusterConfig,
    /// All mutable state, behind one lock (one re-entrant lock,
    /// short critical sections, no RPCs while held).
    pub state: Mutex<MasterState>,
    /// Woken on job arrival or agent state change, so the scheduling
    /// loop does not wait for its full 1s tick to react.
    pub wake: Notify,
}

impl Master {
    /// A fresh master with no jobs or nodes registered.
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MasterState::default()),
            wake: Notify::new(),
        }
    }

    /// Accept a new job submission, enqueue it, and return its id.
    ///
    /// The caller is responsible for validating `request` beforehand;
    /// by the time a `ResourceRequest` reaches here it is always
    /// well-formed, so this never fails.
    pub async fn submit(
        &self,
        user: String,
        command: String,
        request: ResourceRequest,
        priority: i64,
        interactive: bool,
        distributed_type: mgpu_proto::DistributedType,
    ) -> JobId {
        let job = Job::new(user, command, request, priority, interactive, distributed_type);
        let id = job.id;
        let mut state = self.state.lock().await;
        state.queue.insert(job);
        drop(state);
        self.wake.notify_one();
        id
    }

    /// Attach an interactive client's write half to a job's output sink.
    pub async fn attach(&self, job_id: JobId, writer: OwnedWriteHalf) {
        let mut state = self.state.lock().await;
        state.attachments.attach(job_id, writer);
    }

    /// Build the `queue` response snapshot.
    pub async fn queue_snapshot(&self) -> ClientResponseDetail {
        let now = Utc::now();
        let state = self.state.lock().await;
        let queue: Vec<JobSummary> = state.queue.iter_in_order().map(Job::summary).collect();
        let running: Vec<JobSummary> = state.running.values().map(Job::summary).collect();
        let mut nodes = HashMap::new();
        for (node_id, entry) in state.registry.iter() {
            nodes.insert(
                node_id.clone(),
                NodeStatus {
                    available_gpus: entry.available.iter().copied().collect(),
                    running_jobs: entry.running_jobs.iter().cloned().collect(),
                    last_heartbeat_secs_ago: entry.heartbeat_age_secs(now) as f64,
                },
            );
        }
        ClientResponseDetail::Queue {
            queue,
            running,
            nodes,
        }
    }

    /// Fetch a job's buffered output from `from_line` onward, along with
    /// its current state and terminal exit code.
    pub async fn get_job_output(&self, job_id: JobId, from_line: usize) -> ClientResponseDetail {
        let state = self.state.lock().await;
        let Some(job) = state.find_any(job_id) else {
            return ClientResponseDetail::JobOutput {
                job_status: JobState::Unknown,
                output: Vec::new(),
                exit_code: None,
            };
        };
        ClientResponseDetail::JobOutput {
            job_status: job.state,
            output: state.output.from_line(job_id, from_line),
            exit_code: job.exit_code,
        }
    }

    /// Whether this master has ever accepted `job_id`.
    pub async fn job_is_known(&self, job_id: JobId) -> bool {
        self.state.lock().await.find_any(job_id).is_some()
    }

    /// Record a node's first contact or re-registration.
    pub async fn register_node(&self, node_id: String, host: String, port: u16, gpu_count: u32) {
        let mut state = self.state.lock().await;
        info!(node_id = %node_id, %host, port, gpu_count, "node registered");
        state.registry.register(node_id, host, port, gpu_count);
        drop(state);
        self.wake.notify_one();
    }

    /// Reconcile a node's heartbeat, trusting its reported availability.
    pub async fn heartbeat(
        &self,
        node_id: &str,
        available_gpus: HashSet<u32>,
        running_jobs: HashSet<String>,
    ) -> bool {
        let mut state = self.state.lock().await;
        let ok = state.registry.heartbeat(node_id, available_gpus, running_jobs).is_ok();
        drop(state);
        if ok {
            self.wake.notify_one();
        }
        ok
    }

    /// Append one line of output, forwarding it to interactive
    /// attachments if the job has any.
    pub async fn record_output(&self, job_id: JobId, data: String) {
        let mut state = self.state.lock().await;
        state.output.append(job_id, data.clone());
        if state.attachments.has_attachments(job_id) {
            state.attachments.forward_output(job_id, data).await;
        }
    }

    /// Finalize a running job on agent completion. Ignored (per the
    /// state-mismatch rule) if the job is no longer in the running map —
    /// it may already have been cancelled.
    pub async fn job_complete(&self, job_id: JobId, exit_code: i32) {
        let mut state = self.state.lock().await;
        let Some(job) = state.running.remove(&job_id) else {
            return;
        };
        let terminal = if exit_code == 0 {
            JobState::Completed
        } else {
            JobState::Failed
        };
        state.finalize(job, terminal, exit_code, Vec::new()).await;
    }

    /// Resolve a `cancel` request.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyTerminal`] if the job is known
    /// but already completed, failed, or cancelled (idempotent: the
    /// second of two back-to-back cancels on the same id always hits
    /// this), or [`SchedulerError::NotFound`] if the id is unknown.
    pub async fn begin_cancel(&self, job_id: JobId) -> Result<CancelPlan, SchedulerError> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.queue.remove(job_id) {
            state.finalize(job, JobState::Cancelled, CANCELLED_EXIT_CODE, Vec::new()).await;
            return Ok(CancelPlan::AlreadyDone);
        }
        if let Some(job) = state.running.get(&job_id) {
            return Ok(CancelPlan::NeedsAgentCancel {
                job_id,
                node_assignment: job.assignment.clone(),
            });
        }
        if let Some(job) = state.completed.get(&job_id) {
            return Err(SchedulerError::AlreadyTerminal {
                job_id: job_id.to_string(),
                state: job.state.to_string(),
            });
        }
        Err(SchedulerError::NotFound(job_id.to_string()))
    }

    /// Commit a running job's cancellation after the agent has
    /// acknowledged it (or been judged unreachable — the master still
    /// finalizes the job locally either way, since the only recourse is
    /// operator intervention on the node).
    pub async fn finish_cancel(&self, job_id: JobId) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.running.remove(&job_id) {
            state.finalize(job, JobState::Cancelled, CANCELLED_EXIT_CODE, Vec::new()).await;
        }
    }

    /// All queued and running job ids, for `flush`.
    pub async fn all_cancellable(&self) -> Vec<JobId> {
        let state = self.state.lock().await;
        let mut ids: Vec<JobId> = state.queue.iter_in_order().map(|j| j.id).collect();
        ids.extend(state.running.keys().copied());
        ids
    }
}

/// Synthetic exit code assigned to a cancelled job.
pub const CANCELLED_EXIT_CODE: i32 = -3;

/// What `cancel` still needs to do after the initial lock section.
pub enum CancelPlan {
    /// The job was queued and is already fully cancelled.
    AlreadyDone,
    /// The job is running; the caller must RPC the assigned agent(s)
    /// before calling [`Master::finish_cancel`].
    NeedsAgentCancel {
        /// The job being cancelled.
        job_id: JobId,
        /// Its current node→GPU assignment, to know which agents to call.
        node_assignment: HashMap<String, Vec<u32>>,
    },
}

/// A job dispatch pending RPC, collected under lock and acted on after
/// release, following the snapshot/release/RPC/recommit pattern.
pub struct PendingDispatch {
    /// The job being dispatched (already removed from the queue).
    pub job: Job,
    /// Its chosen placement.
    pub assignment: HashMap<String, Vec<u32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgpu_proto::DistributedType;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (OwnedWriteHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_read, write) = server.into_split();
        (write, client)
    }

    async fn read_line(client: &mut TcpStream) -> String {
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read");
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn finalize_sends_completion_to_attached_interactive_client() {
        let master = Master::new(ClusterConfig::default());
        let job_id = master
            .submit(
                "ada".to_string(),
                "echo hi".to_string(),
                ResourceRequest::Flat { gpus_needed: 1 },
                0,
                true,
                DistributedType::Single,
            )
            .await;
        let (writer, mut client) = connected_pair().await;
        master.attach(job_id, writer).await;

        let mut state = master.state.lock().await;
        let job = state.queue.remove(job_id).expect("queued");
        state.finalize(job, JobState::Completed, 0, Vec::new()).await;
        drop(state);

        assert_eq!(read_line(&mut client).await, r#"{"type":"completion","exit_code":0}"#);
    }

    #[tokio::test]
    async fn finalize_infra_failure_sends_error_to_attached_interactive_client() {
        let master = Master::new(ClusterConfig::default());
        let job_id = master
            .submit(
                "ada".to_string(),
                "echo hi".to_string(),
                ResourceRequest::Flat { gpus_needed: 1 },
                0,
                true,
                DistributedType::Single,
            )
            .await;
        let (writer, mut client) = connected_pair().await;
        master.attach(job_id, writer).await;

        let mut state = master.state.lock().await;
        let job = state.queue.remove(job_id).expect("queued");
        state
            .finalize_infra_failure(job, -2, "no healthy node".to_string(), Vec::new())
            .await;
        drop(state);

        assert_eq!(
            read_line(&mut client).await,
            r#"{"type":"error","message":"no healthy node"}"#
        );
        let state = master.state.lock().await;
        let completed = state.completed.get(&job_id).expect("finalized");
        assert_eq!(completed.state, JobState::Failed);
        assert_eq!(completed.exit_code, Some(-2));
    }

    #[tokio::test]
    async fn begin_cancel_on_completed_job_returns_already_terminal() {
        let master = Master::new(ClusterConfig::default());
        let job_id = master
            .submit(
                "ada".to_string(),
                "echo hi".to_string(),
                ResourceRequest::Flat { gpus_needed: 1 },
                0,
                false,
                DistributedType::Single,
            )
            .await;
        let mut state = master.state.lock().await;
        let job = state.queue.remove(job_id).expect("queued");
        state.finalize(job, JobState::Completed, 0, Vec::new()).await;
        drop(state);

        let err = master.begin_cancel(job_id).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::AlreadyTerminal { state, .. } if state == "completed"
        ));
    }

    #[tokio::test]
    async fn begin_cancel_on_unknown_job_returns_not_found() {
        let master = Master::new(ClusterConfig::default());
        let err = master.begin_cancel(JobId::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }
}
