//! The agent's TCP front door: accepts `run`/`cancel`/`get_resources`
//! requests from the master.

use std::net::SocketAddr;
use std::sync::Arc;

use mgpu_proto::{read_json_line, write_json_line, AgentResponse, AgentResponseDetail, JobId, MasterToAgent};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::supervisor::{self, LaunchSpec};

/// Bind the agent's listener without yet serving connections, so the
/// caller can learn the bound port (useful with `:0`) before
/// registering with the master.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Serve incoming master requests until the listener errors.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub async fn serve(agent: Arc<Agent>, listener: TcpListener) -> std::io::Result<()> {
    info!(local_addr = %listener.local_addr()?, "agent listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(agent, stream).await {
                warn!(%peer, error = %e, "connection handler failed");
            }
        });
    }
}

async fn handle_connection(agent: Arc<Agent>, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let request: Option<MasterToAgent> = read_json_line(&mut reader)
        .await
        .map_err(std::io::Error::other)?;
    let Some(request) = request else {
        return Ok(());
    };
    let response = handle_request(&agent, request).await;
    write_json_line(&mut write_half, &response)
        .await
        .map_err(std::io::Error::other)
}

async fn handle_request(agent: &Arc<Agent>, request: MasterToAgent) -> AgentResponse {
    match request {
        MasterToAgent::Run {
            job_id,
            command,
            user,
            gpus,
            interactive,
            rank,
            world_size,
            master_node,
            distributed_type,
        } => {
            handle_run(
                agent,
                job_id,
                command,
                user,
                gpus,
                interactive,
                rank,
                world_size,
                master_node,
                distributed_type.unwrap_or(mgpu_proto::DistributedType::Single),
            )
            .await
        }
        MasterToAgent::Cancel { job_id } => handle_cancel(agent, job_id).await,
        MasterToAgent::GetResources {} => {
            let available_gpus = agent.available_gpus().await;
            let gpu_count = agent.gpu_count().await;
            AgentResponse::Ok(AgentResponseDetail::Resources {
                available_gpus,
                gpu_count,
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_run(
    agent: &Arc<Agent>,
    job_id_raw: String,
    command: String,
    user: String,
    gpus: Vec<u32>,
    interactive: bool,
    rank: Option<u32>,
    world_size: Option<u32>,
    master_node: Option<String>,
    distributed_type: mgpu_proto::DistributedType,
) -> AgentResponse {
    let Ok(job_id) = JobId::parse(&job_id_raw) else {
        return AgentResponse::Error {
            message: format!("invalid job id: {job_id_raw}"),
        };
    };

    if let Err(e) = agent.reserve(&gpus).await {
        return AgentResponse::Error {
            message: format!("gpu reservation failed: {e}"),
        };
    }

    let spec = LaunchSpec {
        job_id,
        user,
        command,
        gpus: gpus.clone(),
        interactive,
        rank,
        world_size,
        master_node,
        distributed_type,
    };

    match supervisor::spawn_and_supervise(Arc::clone(agent), spec).await {
        Ok(pid) => {
            agent.record_running(job_id, gpus, pid).await;
            AgentResponse::Ok(AgentResponseDetail::Message {
                message: format!("started pid {pid}"),
            })
        }
        Err(e) => {
            agent.release_reservation(&gpus).await;
            AgentResponse::Error {
                message: format!("spawn failed: {e}"),
            }
        }
    }
}

async fn handle_cancel(agent: &Arc<Agent>, job_id_raw: String) -> AgentResponse {
    let Ok(job_id) = JobId::parse(&job_id_raw) else {
        return AgentResponse::Error {
            message: format!("invalid job id: {job_id_raw}"),
        };
    };
    let Some(pid) = agent.running_pid(job_id).await else {
        return AgentResponse::Error {
            message: format!("job not running: {job_id}"),
        };
    };
    match supervisor::kill_process_group(pid) {
        Ok(()) => AgentResponse::Ok(AgentResponseDetail::Message {
            message: "killed".to_string(),
        }),
        Err(e) => AgentResponse::Error {
            message: format!("kill failed: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use mgpu_proto::GpuInventoryEntry;

    use super::*;
    use crate::config::NodeConfig;
    use crate::inventory::FakeProbe;

    fn agent() -> Arc<Agent> {
        let probe = FakeProbe::new().with_gpu(GpuInventoryEntry {
            index: 0,
            name: "Test GPU".to_string(),
            memory_total_mib: 1000,
            memory_used_mib: 0,
        });
        Arc::new(Agent::new(NodeConfig::default(), &probe).expect("builds"))
    }

    #[tokio::test]
    async fn get_resources_reports_current_availability() {
        let agent = agent();
        let response = handle_request(&agent, MasterToAgent::GetResources {}).await;
        match response {
            AgentResponse::Ok(AgentResponseDetail::Resources {
                available_gpus,
                gpu_count,
            }) => {
                assert_eq!(available_gpus, vec![0]);
                assert_eq!(gpu_count, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_an_error() {
        let agent = agent();
        let response = handle_cancel(&agent, JobId::new().to_string()).await;
        assert!(matches!(response, AgentResponse::Error { .. }));
    }

    #[tokio::test]
    async fn cancel_rejects_malformed_job_id() {
        let agent = agent();
        let response = handle_cancel(&agent, "not-a-job-id".to_string()).await;
        assert!(matches!(response, AgentResponse::Error { .. }));
    }

    #[tokio::test]
    async fn run_with_unavailable_gpu_is_rejected_without_spawning() {
        let agent = agent();
        agent.reserve(&[0]).await.expect("reserves");
        let response = handle_run(
            &agent,
            JobId::new().to_string(),
            "echo hi".to_string(),
            "ada".to_string(),
            vec![0],
            false,
            None,
            None,
            None,
            mgpu_proto::DistributedType::Single,
        )
        .await;
        assert!(matches!(response, AgentResponse::Error { .. }));
    }
}
