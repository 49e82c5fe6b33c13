//! The node monitor: every 10s, drops nodes whose heartbeat has gone
//! stale past the dead threshold and fails any jobs still assigned to
//! them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mgpu_proto::JobState;
use tokio::time::interval;
use tracing::warn;

use crate::master::Master;

const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const NODE_DEATH_EXIT_CODE: i32 = -1;

/// Run the node-death monitor until the process exits.
pub async fn run(master: Arc<Master>) {
    let mut ticker = interval(MONITOR_INTERVAL);
    loop {
        ticker.tick().await;
        sweep_dead_nodes(&master).await;
    }
}

async fn sweep_dead_nodes(master: &Master) {
    let now = Utc::now();
    let mut state = master.state.lock().await;
    let dead_ids = state.registry.dead_node_ids(now);
    for node_id in dead_ids {
        let Some(entry) = state.registry.remove(&node_id) else {
            continue;
        };
        warn!(node_id = %node_id, "node heartbeat stale, removing and failing its jobs");
        for job_id_str in entry.running_jobs {
            let Ok(job_id) = mgpu_proto::JobId::parse(&job_id_str) else {
                continue;
            };
            let Some(job) = state.running.remove(&job_id) else {
                continue;
            };
            let line = format!("node {node_id} failure: heartbeat exceeded dead threshold");
            state
                .finalize_infra_failure(job, NODE_DEATH_EXIT_CODE, line.clone(), vec![line])
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use mgpu_proto::{DistributedType, ResourceRequest};

    #[tokio::test]
    async fn dead_node_fails_its_running_jobs() {
        let master = Master::new(crate::config::ClusterConfig::default());
        master.register_node("n1".to_string(), "h".to_string(), 1, 2).await;
        let job_id = master
            .submit(
                "ada".to_string(),
                "sleep 60".to_string(),
                ResourceRequest::Flat { gpus_needed: 1 },
                0,
                false,
                DistributedType::Single,
            )
            .await;
        {
            let mut state = master.state.lock().await;
            let mut job = state.queue.remove(job_id).expect("queued");
            state.registry.reserve("n1", &[0], job_id.to_string()).expect("reserve");
            let mut assignment = std::collections::HashMap::new();
            assignment.insert("n1".to_string(), vec![0]);
            job.start(assignment);
            state.running.insert(job_id, job);
        }
        // The monitor only checks a node's age against `now` when it
        // sweeps, so a far-future `now` stands in for the 60s wait
        // without an actual sleep.
        let far_future = Utc::now() + ChronoDuration::seconds(61);
        sweep_dead_nodes_at(&master, far_future).await;
        let state = master.state.lock().await;
        assert!(state.registry.get("n1").is_none());
        let job = state.completed.get(&job_id).expect("finalized");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.exit_code, Some(NODE_DEATH_EXIT_CODE));
    }

    /// Test-only variant of [`sweep_dead_nodes`] parameterized on `now`,
    /// since the real heartbeat clock can't be rewound from outside.
    async fn sweep_dead_nodes_at(master: &Master, now: chrono::DateTime<Utc>) {
        let mut state = master.state.lock().await;
        let dead_ids = state.registry.dead_node_ids(now);
        for node_id in dead_ids {
            let Some(entry) = state.registry.remove(&node_id) else {
                continue;
            };
            for job_id_str in entry.running_jobs {
                let Ok(job_id) = mgpu_proto::JobId::parse(&job_id_str) else {
                    continue;
                };
                let Some(job) = state.running.remove(&job_id) else {
                    continue;
                };
                let line = format!("node {node_id} failure: heartbeat exceeded dead threshold");
                state
                    .finalize_infra_failure(job, NODE_DEATH_EXIT_CODE, line.clone(), vec![line])
                    .await;
            }
        }
    }
}
