//! The `Job` value and its lifecycle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mgpu_proto::{DistributedType, JobId, JobState, JobSummary, ResourceRequest};

/// One job accepted by the master, from submission through finalization.
#[derive(Debug, Clone)]
pub struct Job {
    /// The job's id, assigned at accept time.
    pub id: JobId,
    /// OS identity the job's process runs as.
    pub user: String,
    /// Shell command line.
    pub command: String,
    /// The resource shape requested at submission.
    pub request: ResourceRequest,
    /// Queue priority; larger runs earlier.
    pub priority: i64,
    /// Whether the submitting client's socket is an attached output sink.
    pub interactive: bool,
    /// Multi-host rendezvous framework, `single` for ordinary jobs.
    pub distributed_type: DistributedType,
    /// Current lifecycle state.
    pub state: JobState,
    /// When the job was accepted.
    pub submitted_at: DateTime<Utc>,
    /// When the job entered `running`, if it has.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job entered a terminal state, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal exit code, once finalized.
    pub exit_code: Option<i32>,
    /// Concrete node → GPU-index placement, once dispatched.
    pub assignment: HashMap<String, Vec<u32>>,
    /// Consecutive dispatch (RPC) failures for this job.
    pub dispatch_failures: u32,
    /// Consecutive scheduling cycles in which no placement was found.
    pub no_placement_cycles: u32,
    /// Earliest time a dispatch retry may be attempted again, set after
    /// a failed dispatch to the exponential-backoff delay for the
    /// attempt just made. `None` means retry immediately.
    pub retry_not_before: Option<DateTime<Utc>>,
}

impl Job {
    /// Construct a new job in the `queued` state.
    #[must_use]
    pub fn new(
        user: String,
        command: String,
        request: ResourceRequest,
        priority: i64,
        interactive: bool,
        distributed_type: DistributedType,
    ) -> Self {
        Self {
            id: JobId::new(),
            user,
            command,
            request,
            priority,
            interactive,
            distributed_type,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            assignment: HashMap::new(),
            dispatch_failures: 0,
            no_placement_cycles: 0,
            retry_not_before: None,
        }
    }

    /// Mark the job running with the given placement.
    pub fn start(&mut self, assignment: HashMap<String, Vec<u32>>) {
        self.assignment = assignment;
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        self.dispatch_failures = 0;
        self.no_placement_cycles = 0;
        self.retry_not_before = None;
    }

    /// Finalize the job with a terminal state and exit code.
    pub fn finish(&mut self, state: JobState, exit_code: i32) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.exit_code = Some(exit_code);
        self.ended_at = Some(Utc::now());
    }

    /// Revert a failed dispatch attempt: the job goes back to `queued`
    /// with no assignment, retry counter already bumped by the caller.
    /// `retry_not_before` gates the next dispatch attempt by the
    /// exponential backoff due for the attempt just made.
    pub fn revert_to_queued(&mut self, retry_not_before: DateTime<Utc>) {
        self.assignment.clear();
        self.state = JobState::Queued;
        self.started_at = None;
        self.retry_not_before = Some(retry_not_before);
    }

    /// Build the `queue`/`get_job_output` summary view of this job.
    #[must_use]
    pub fn summary(&self) -> JobSummary {
        let (node_id, gpus) = self
            .assignment
            .iter()
            .next()
            .map(|(n, g)| (Some(n.clone()), g.clone()))
            .unwrap_or((None, Vec::new()));
        JobSummary {
            job_id: self.id.to_string(),
            user: self.user.clone(),
            command: self.command.clone(),
            state: self.state,
            priority: self.priority,
            node_id,
            gpus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_job(gpus: u32, priority: i64) -> Job {
        Job::new(
            "ada".to_string(),
            "echo hi".to_string(),
            ResourceRequest::Flat { gpus_needed: gpus },
            priority,
            false,
            mgpu_proto::DistributedType::Single,
        )
    }

    #[test]
    fn new_job_starts_queued() {
        let job = flat_job(1, 0);
        assert_eq!(job.state, JobState::Queued);
        assert!(job.started_at.is_none());
        assert!(job.assignment.is_empty());
    }

    #[test]
    fn start_records_assignment_and_clears_retry_counters() {
        let mut job = flat_job(1, 0);
        job.dispatch_failures = 3;
        job.no_placement_cycles = 4;
        let mut assignment = HashMap::new();
        assignment.insert("n1".to_string(), vec![0]);
        job.start(assignment.clone());
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.assignment, assignment);
        assert_eq!(job.dispatch_failures, 0);
        assert_eq!(job.no_placement_cycles, 0);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn finish_sets_terminal_state_and_exit_code() {
        let mut job = flat_job(1, 0);
        job.finish(JobState::Completed, 0);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.ended_at.is_some());
    }

    #[test]
    fn revert_to_queued_clears_assignment() {
        let mut job = flat_job(1, 0);
        let mut assignment = HashMap::new();
        assignment.insert("n1".to_string(), vec![0]);
        job.start(assignment);
        job.revert_to_queued(Utc::now());
        assert_eq!(job.state, JobState::Queued);
        assert!(job.assignment.is_empty());
        assert!(job.retry_not_before.is_some());
    }

    #[test]
    fn summary_reflects_single_node_assignment() {
        let mut job = flat_job(2, 5);
        let mut assignment = HashMap::new();
        assignment.insert("n1".to_string(), vec![0, 1]);
        job.start(assignment);
        let summary = job.summary();
        assert_eq!(summary.node_id, Some("n1".to_string()));
        assert_eq!(summary.gpus, vec![0, 1]);
        assert_eq!(summary.priority, 5);
    }
}
