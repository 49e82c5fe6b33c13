//! The queued-job list, scanned in priority-descending,
//! submit-time-ascending order.

use mgpu_proto::JobId;

use crate::job::Job;

/// FIFO-per-priority queue of not-yet-running jobs.
///
/// Jobs are appended at the tail on submit and reinserted at their
/// priority-sorted position on dispatch-retry, matching the "queue
/// position" wording: re-queued jobs rejoin the pool at the point their
/// priority and original submit time would place them, not at the tail.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Insert a job, keeping priority-descending / submit-time-ascending order.
    pub fn insert(&mut self, job: Job) {
        let pos = self
            .jobs
            .iter()
            .position(|existing| Self::order_key(existing) < Self::order_key(&job))
            .unwrap_or(self.jobs.len());
        self.jobs.insert(pos, job);
    }

    fn order_key(job: &Job) -> (i64, std::cmp::Reverse<chrono::DateTime<chrono::Utc>>) {
        (job.priority, std::cmp::Reverse(job.submitted_at))
    }

    /// Iterate queued jobs in scheduling order (highest priority, then
    /// earliest submit time, first).
    pub fn iter_in_order(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// Remove and return the job at `index`, shifting later entries down.
    pub fn remove_at(&mut self, index: usize) -> Job {
        self.jobs.remove(index)
    }

    /// Find a queued job by id, returning its index and a reference.
    #[must_use]
    pub fn find(&self, id: JobId) -> Option<(usize, &Job)> {
        self.jobs
            .iter()
            .position(|j| j.id == id)
            .map(|i| (i, &self.jobs[i]))
    }

    /// Find a queued job by id, for mutating its retry counters in place
    /// without disturbing its queue position.
    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Remove a queued job by id.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let idx = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(idx))
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drain every queued job, e.g. for a `flush`.
    pub fn drain_all(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgpu_proto::ResourceRequest;
    use std::thread::sleep;
    use std::time::Duration;

    fn job(priority: i64) -> Job {
        Job::new(
            "ada".to_string(),
            "echo hi".to_string(),
            ResourceRequest::Flat { gpus_needed: 1 },
            priority,
            false,
            mgpu_proto::DistributedType::Single,
        )
    }

    #[test]
    fn higher_priority_sorts_first() {
        let mut q = JobQueue::new();
        q.insert(job(1));
        q.insert(job(5));
        q.insert(job(3));
        let priorities: Vec<i64> = q.iter_in_order().map(|j| j.priority).collect();
        assert_eq!(priorities, vec![5, 3, 1]);
    }

    #[test]
    fn equal_priority_preserves_submit_order() {
        let mut q = JobQueue::new();
        let a = job(5);
        sleep(Duration::from_millis(2));
        let b = job(5);
        let a_id = a.id;
        let b_id = b.id;
        q.insert(a);
        q.insert(b);
        let ids: Vec<_> = q.iter_in_order().map(|j| j.id).collect();
        assert_eq!(ids, vec![a_id, b_id]);
    }

    #[test]
    fn remove_by_id_drops_exactly_one() {
        let mut q = JobQueue::new();
        let a = job(1);
        let a_id = a.id;
        q.insert(a);
        q.insert(job(2));
        assert!(q.remove(a_id).is_some());
        assert_eq!(q.len(), 1);
        assert!(q.remove(a_id).is_none());
    }

    #[test]
    fn drain_all_empties_queue() {
        let mut q = JobQueue::new();
        q.insert(job(1));
        q.insert(job(2));
        let drained = q.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
    }
}
