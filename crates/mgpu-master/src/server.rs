//! The master's TCP front door: one listener accepts connections from
//! both submission clients and node agents, distinguished by which
//! message shape a line parses as.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use mgpu_proto::{
    AckResponse, AgentToMaster, ClientRequest, ClientResponse, ClientResponseDetail,
    DistributedType, JobId, MasterToAgent, NodeId, ResourceRequest,
};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::dispatch;
use crate::master::{CancelPlan, Master};

/// Accept connections on `bind_addr` until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run(master: Arc<Master>, bind_addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "master listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let master = Arc::clone(&master);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(master, stream).await {
                warn!(%peer, error = %e, "connection handler failed");
            }
        });
    }
}

async fn handle_connection(master: Arc<Master>, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let Some(line) = read_one_line(&mut reader).await? else {
        return Ok(());
    };

    if let Ok(request) = serde_json::from_str::<ClientRequest>(&line) {
        let (response, keep_open) = handle_client_request(&master, request).await;
        mgpu_proto::write_json_line(&mut write_half, &response)
            .await
            .map_err(std::io::Error::other)?;
        if keep_open {
            if let ClientResponse::Ok(ClientResponseDetail::Submitted { job_id, .. }) = &response {
                if let Ok(id) = JobId::parse(job_id) {
                    master.attach(id, write_half).await;
                }
            }
        }
        return Ok(());
    }

    if let Ok(message) = serde_json::from_str::<AgentToMaster>(&line) {
        let ack = handle_agent_message(&master, message).await;
        mgpu_proto::write_json_line(&mut write_half, &ack)
            .await
            .map_err(std::io::Error::other)?;
        return Ok(());
    }

    let response = ClientResponse::error(format!("unrecognized message: {line}"));
    mgpu_proto::write_json_line(&mut write_half, &response)
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

async fn read_one_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<Option<String>> {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    let mut limited = reader.take(mgpu_proto::READ_BUFFER_LIMIT as u64 + 1);
    let n = limited.read_line(&mut line).await?;
    if n == 0 || line.len() > mgpu_proto::READ_BUFFER_LIMIT || line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Returns the response to send and whether the socket should be kept
/// open afterward (interactive submissions only).
async fn handle_client_request(
    master: &Master,
    request: ClientRequest,
) -> (ClientResponse, bool) {
    match request {
        ClientRequest::Submit {
            user,
            command,
            gpus,
            node_gpu_ids,
            node_count,
            gpus_per_node,
            include_nodes,
            exclude_nodes,
            priority,
            interactive,
            distributed_type,
        } => {
            if user.is_empty() || command.is_empty() {
                return (
                    ClientResponse::error("bad_request: user and command are required"),
                    false,
                );
            }
            let resource = match build_resource_request(
                gpus,
                node_gpu_ids,
                node_count,
                gpus_per_node,
                include_nodes,
                exclude_nodes,
            ) {
                Ok(r) => r,
                Err(message) => return (ClientResponse::error(message), false),
            };
            let interactive = interactive.unwrap_or(false);
            let job_id = master
                .submit(
                    user,
                    command,
                    resource,
                    priority.unwrap_or(0),
                    interactive,
                    distributed_type.unwrap_or(DistributedType::Single),
                )
                .await;
            let detail = ClientResponseDetail::Submitted {
                job_id: job_id.to_string(),
                interactive: interactive.then_some(true),
            };
            (ClientResponse::Ok(detail), interactive)
        }
        ClientRequest::Queue {} => (ClientResponse::Ok(master.queue_snapshot().await), false),
        ClientRequest::Cancel { job_id } => {
            let Ok(id) = JobId::parse(&job_id) else {
                return (ClientResponse::error(format!("invalid job id: {job_id}")), false);
            };
            match cancel_job(master, id).await {
                Ok(()) => (
                    ClientResponse::Ok(ClientResponseDetail::Message {
                        message: "cancelled".to_string(),
                    }),
                    false,
                ),
                Err(message) => (ClientResponse::error(message), false),
            }
        }
        ClientRequest::Flush {} => {
            let ids = master.all_cancellable().await;
            let mut n = 0;
            for id in ids {
                if cancel_job(master, id).await.is_ok() {
                    n += 1;
                }
            }
            (
                ClientResponse::Ok(ClientResponseDetail::Message {
                    message: format!("flushed {n} jobs"),
                }),
                false,
            )
        }
        ClientRequest::GetJobOutput { job_id, from_line } => {
            let Ok(id) = JobId::parse(&job_id) else {
                return (ClientResponse::error(format!("invalid job id: {job_id}")), false);
            };
            (
                ClientResponse::Ok(master.get_job_output(id, from_line).await),
                false,
            )
        }
    }
}

fn build_resource_request(
    gpus: Option<u32>,
    node_gpu_ids: Option<std::collections::HashMap<NodeId, Vec<u32>>>,
    node_count: Option<u32>,
    gpus_per_node: Option<u32>,
    include_nodes: Option<Vec<NodeId>>,
    exclude_nodes: Option<Vec<NodeId>>,
) -> Result<ResourceRequest, String> {
    if let Some(assignment) = node_gpu_ids {
        return Ok(ResourceRequest::Pinned { assignment });
    }
    if let (Some(node_count), Some(gpus_per_node)) = (node_count, gpus_per_node) {
        return Ok(ResourceRequest::Shaped {
            node_count,
            gpus_per_node,
            include: include_nodes,
            exclude: exclude_nodes,
        });
    }
    if let Some(gpus_needed) = gpus {
        return Ok(ResourceRequest::Flat { gpus_needed });
    }
    Err("bad_request: one of gpus, node_gpu_ids, or node_count+gpus_per_node is required"
        .to_string())
}

/// Resolve a `cancel`, RPC-ing the assigned agent(s) if the job is
/// running.
///
/// # Errors
///
/// Returns the human-readable message for a `not_found` response.
async fn cancel_job(master: &Master, job_id: JobId) -> Result<(), String> {
    match master.begin_cancel(job_id).await {
        Ok(CancelPlan::AlreadyDone) => Ok(()),
        Ok(CancelPlan::NeedsAgentCancel {
            job_id,
            node_assignment,
        }) => {
            for node_id in node_assignment.keys() {
                let Some((host, port)) = {
                    let state = master.state.lock().await;
                    state.registry.get(node_id).map(|e| (e.host.clone(), e.port))
                } else {
                    continue;
                };
                let req = MasterToAgent::Cancel {
                    job_id: job_id.to_string(),
                };
                if let Err(e) = dispatch::dispatch(node_id, &host, port, &req).await {
                    warn!(job_id = %job_id, node_id, error = %e, "cancel rpc failed, finalizing locally anyway");
                }
            }
            master.finish_cancel(job_id).await;
            Ok(())
        }
        Err(e) => Err(format!("not_found: {e}")),
    }
}

async fn handle_agent_message(master: &Master, message: AgentToMaster) -> AckResponse {
    match message {
        AgentToMaster::NodeRegister {
            node_id,
            host,
            port,
            gpu_count,
            ..
        } => {
            master.register_node(node_id, host, port, gpu_count).await;
            AckResponse::ok()
        }
        AgentToMaster::NodeHeartbeat {
            node_id,
            available_gpus,
            running_jobs,
        } => {
            let available: HashSet<u32> = available_gpus.into_iter().collect();
            let running: HashSet<String> = running_jobs.into_iter().collect();
            if master.heartbeat(&node_id, available, running).await {
                AckResponse::ok()
            } else {
                AckResponse::error(format!("node not registered: {node_id}"))
            }
        }
        AgentToMaster::JobOutput { job_id, data, .. } => {
            let Ok(id) = JobId::parse(&job_id) else {
                return AckResponse::error(format!("invalid job id: {job_id}"));
            };
            master.record_output(id, data).await;
            AckResponse::ok()
        }
        AgentToMaster::JobComplete {
            job_id, exit_code, ..
        } => {
            let Ok(id) = JobId::parse(&job_id) else {
                return AckResponse::error(format!("invalid job id: {job_id}"));
            };
            master.job_complete(id, exit_code).await;
            AckResponse::ok()
        }
    }
}
