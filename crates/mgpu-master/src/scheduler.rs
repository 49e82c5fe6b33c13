//! The scheduling loop: wakes on job arrival, agent state change, or a
//! 1s tick, and tries to place every queued job against the current
//! registry snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mgpu_proto::{AgentResponseDetail, DistributedType, JobId, JobState, MasterToAgent};
use tokio::time::interval;
use tracing::{info, warn};

use crate::dispatch::{
    self, DIAGNOSIS_INTERVAL_CYCLES, MAX_DISPATCH_FAILURES, MAX_NO_PLACEMENT_CYCLES,
};
use crate::job::Job;
use crate::master::{Master, PendingDispatch};
use crate::placement::find_placement;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const NO_PLACEMENT_EXIT_CODE: i32 = -2;
const DISPATCH_EXHAUSTED_EXIT_CODE: i32 = -1;

/// Run the scheduling loop until the process exits. Intended to be
/// spawned as one of the master's long-lived tasks.
pub async fn run(master: Arc<Master>) {
    let mut ticker = interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = master.wake.notified() => {}
        }
        schedule_once(&master).await;
    }
}

async fn schedule_once(master: &Master) {
    let now = Utc::now();

    // Phase 1: under lock, scan the queue in order and commit every
    // placement that fits against the registry snapshot as we go (an
    // earlier commit in this pass changes what later candidates see).
    let mut dispatches: Vec<PendingDispatch> = Vec::new();
    {
        let mut state = master.state.lock().await;
        let order: Vec<JobId> = state.queue.iter_in_order().map(|j| j.id).collect();
        for job_id in order {
            let Some((_, job_ref)) = state.queue.find(job_id) else {
                continue; // already removed earlier in this pass
            };
            if let Some(not_before) = job_ref.retry_not_before {
                if now < not_before {
                    continue; // still within this job's dispatch backoff window
                }
            }
            match find_placement(&job_ref.request, &state.registry, now) {
                Ok(assignment) => {
                    for (node_id, gpus) in &assignment {
                        if let Err(e) = state.registry.reserve(node_id, gpus, job_id.to_string()) {
                            warn!(job_id = %job_id, error = %e, "placement reservation failed unexpectedly");
                        }
                    }
                    let job = state.queue.remove(job_id).expect("found above");
                    dispatches.push(PendingDispatch { job, assignment });
                }
                Err(_diagnosis) => {
                    if let Some(job) = state.queue.get_mut(job_id) {
                        job.no_placement_cycles += 1;
                    }
                }
            }
        }
    }

    // Phase 1b: diagnosis logging and retry-exhaustion finalization for
    // jobs left in the queue whose counter just crossed a threshold.
    handle_no_placement_outcomes(master, now).await;

    // Phase 2: no lock held — RPC each pending dispatch's agent(s).
    for pending in dispatches {
        dispatch_job(master, pending).await;
    }
}

/// Sweep queued jobs whose `no_placement_cycles` just crossed the
/// diagnosis or exhaustion thresholds. Run after phase 1's increments so
/// thresholds are read post-increment.
async fn handle_no_placement_outcomes(master: &Master, now: chrono::DateTime<Utc>) {
    let mut to_finalize: Vec<(Job, Vec<String>)> = Vec::new();
    {
        let mut state = master.state.lock().await;
        let order: Vec<JobId> = state.queue.iter_in_order().map(|j| j.id).collect();
        for job_id in order {
            let cycles = match state.queue.find(job_id) {
                Some((_, job)) => job.no_placement_cycles,
                None => continue,
            };
            if cycles == 0 {
                continue;
            }
            if cycles >= MAX_NO_PLACEMENT_CYCLES {
                let job = state.queue.remove(job_id).expect("found above");
                let diagnosis = match find_placement(&job.request, &state.registry, now) {
                    Ok(_) => continue, // became placeable between scans; leave queued
                    Err(d) => d,
                };
                to_finalize.push((job, diagnosis.to_lines()));
            } else if cycles % DIAGNOSIS_INTERVAL_CYCLES == 0 {
                if let Err(diagnosis) = find_placement(
                    &state.queue.find(job_id).expect("present").1.request,
                    &state.registry,
                    now,
                ) {
                    let lines = diagnosis.to_lines();
                    state.output.extend(job_id, lines);
                }
            }
        }
        for (job, lines) in to_finalize.drain(..) {
            let job_id = job.id;
            info!(job_id = %job_id, "job finalized failed: no-placement retries exhausted");
            state
                .finalize_infra_failure(
                    job,
                    NO_PLACEMENT_EXIT_CODE,
                    "no healthy node could satisfy this request".to_string(),
                    lines,
                )
                .await;
        }
    }
}

async fn dispatch_job(master: &Master, pending: PendingDispatch) {
    let PendingDispatch { mut job, assignment } = pending;
    let job_id = job.id;

    let mut node_ids: Vec<&String> = assignment.keys().collect();
    node_ids.sort();
    let world_size = node_ids.len() as u32;
    let master_node_id = node_ids.first().copied().cloned();

    let mut requests = Vec::new();
    {
        let state = master.state.lock().await;
        for (rank, node_id) in node_ids.iter().enumerate() {
            let Some(entry) = state.registry.get(node_id) else {
                continue;
            };
            let master_hostname = master_node_id
                .as_ref()
                .and_then(|id| master.config.hostname_of(id))
                .or_else(|| master_node_id.as_deref())
                .unwrap_or("localhost")
                .to_string();
            let req = MasterToAgent::Run {
                job_id: job_id.to_string(),
                command: job.command.clone(),
                user: job.user.clone(),
                gpus: assignment[node_id.as_str()].clone(),
                interactive: job.interactive,
                rank: (job.distributed_type != DistributedType::Single).then_some(rank as u32),
                world_size: (job.distributed_type != DistributedType::Single).then_some(world_size),
                master_node: (job.distributed_type != DistributedType::Single)
                    .then_some(master_hostname),
                distributed_type: Some(job.distributed_type),
            };
            requests.push(((*node_id).clone(), entry.host.clone(), entry.port, req));
        }
    }

    let mut succeeded: Vec<String> = Vec::new();
    let mut failed_node: Option<String> = None;
    for (node_id, host, port, req) in &requests {
        match dispatch::dispatch(node_id, host, *port, req).await {
            Ok(AgentResponseDetail::Message { .. } | AgentResponseDetail::Resources { .. }) => {
                succeeded.push(node_id.clone());
                master.state.lock().await.registry.record_success(node_id);
            }
            Err(e) => {
                warn!(job_id = %job_id, node_id = %node_id, error = %e, "run dispatch failed");
                master.state.lock().await.registry.record_failure(node_id);
                failed_node = Some(node_id.clone());
                break;
            }
        }
    }

    let mut state = master.state.lock().await;
    if failed_node.is_some() {
        // Roll back every reservation for this job, including any nodes
        // that already accepted the run — a partially-dispatched
        // multi-host job is not usable.
        for (node_id, gpus) in &assignment {
            state.registry.release(node_id, gpus, job_id.to_string().as_str());
        }
        job.dispatch_failures += 1;
        if job.dispatch_failures >= MAX_DISPATCH_FAILURES {
            info!(job_id = %job_id, "job finalized failed: dispatch retries exhausted");
            state
                .finalize_infra_failure(
                    job,
                    DISPATCH_EXHAUSTED_EXIT_CODE,
                    "agent unreachable or rejected the run after repeated retries".to_string(),
                    Vec::new(),
                )
                .await;
        } else {
            let backoff = dispatch::backoff_for_attempt(job.dispatch_failures.saturating_sub(1));
            let retry_not_before =
                Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
            job.revert_to_queued(retry_not_before);
            state.queue.insert(job);
        }
        return;
    }

    let mut assignment_map = HashMap::new();
    for (node_id, gpus) in assignment {
        assignment_map.insert(node_id, gpus);
    }
    job.start(assignment_map);
    info!(job_id = %job_id, "job dispatched and running");
    state.running.insert(job_id, job);
}
