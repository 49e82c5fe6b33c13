//! Agent RPC dispatch: a single "connect, send, await response with a
//! deadline" combinator used uniformly for `run`, `cancel`, and
//! `get_resources`, factoring out the ad-hoc retry/backoff call sites
//! a scheduler like this tends to scatter.

use std::time::Duration;

use mgpu_proto::{read_json_line, write_json_line, AgentResponse, MasterToAgent};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::error::DispatchError;

/// Deadline for a single RPC attempt to an agent.
pub const RPC_DEADLINE: Duration = Duration::from_secs(10);

/// Initial backoff between dispatch retries for a job.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff between dispatch retries for a job.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Consecutive dispatch failures after which a job is finalized failed.
pub const MAX_DISPATCH_FAILURES: u32 = 5;

/// Consecutive no-placement scheduling cycles after which a job is
/// finalized failed.
pub const MAX_NO_PLACEMENT_CYCLES: u32 = 10;

/// Scheduling cycles between recorded diagnoses for a stuck job.
pub const DIAGNOSIS_INTERVAL_CYCLES: u32 = 5;

/// Backoff delay for the `attempt`'th dispatch retry (0-based), capped
/// at [`MAX_BACKOFF`].
#[must_use]
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let scaled = INITIAL_BACKOFF.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(MAX_BACKOFF)
}

/// Open a fresh connection to `host:port`, send one request, and read
/// one response, all within [`RPC_DEADLINE`].
///
/// A new connection is used per RPC, matching the wire protocol's
/// request/response style: write one message, read one message, close.
///
/// # Errors
///
/// Returns [`DispatchError::Timeout`] if the whole exchange does not
/// complete within the deadline, [`DispatchError::Transport`] on a
/// connect/IO/framing failure, or [`DispatchError::Rejected`] if the
/// agent replied with `status: "error"`.
pub async fn send_to_node(
    node_id: &str,
    host: &str,
    port: u16,
    request: &MasterToAgent,
) -> Result<AgentResponse, DispatchError> {
    let fut = send_to_node_inner(host, port, request);
    match timeout(RPC_DEADLINE, fut).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(source)) => Err(DispatchError::Transport {
            node_id: node_id.to_string(),
            source,
        }),
        Err(_elapsed) => Err(DispatchError::Timeout {
            node_id: node_id.to_string(),
            deadline_secs: RPC_DEADLINE.as_secs(),
        }),
    }
}

async fn send_to_node_inner(
    host: &str,
    port: u16,
    request: &MasterToAgent,
) -> Result<AgentResponse, mgpu_proto::ProtoError> {
    let stream = TcpStream::connect((host, port)).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_json_line(&mut write_half, request).await?;
    let mut reader = BufReader::new(read_half);
    let response: Option<AgentResponse> = read_json_line(&mut reader).await?;
    response.ok_or(mgpu_proto::ProtoError::ConnectionClosed)
}

/// Send `request` to a node, treating an `AgentResponse::Error` as a
/// [`DispatchError::Rejected`] rather than a bare `Ok`.
///
/// # Errors
///
/// See [`send_to_node`]; additionally returns
/// [`DispatchError::Rejected`] when the agent's response has
/// `status: "error"`.
pub async fn dispatch(
    node_id: &str,
    host: &str,
    port: u16,
    request: &MasterToAgent,
) -> Result<mgpu_proto::AgentResponseDetail, DispatchError> {
    match send_to_node(node_id, host, port, request).await? {
        AgentResponse::Ok(detail) => Ok(detail),
        AgentResponse::Error { message } => {
            warn!(node_id, %message, "agent rejected request");
            Err(DispatchError::Rejected {
                node_id: node_id.to_string(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        assert_eq!(backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(10), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn dispatch_to_unreachable_host_is_a_transport_error() {
        // Port 0 never accepts; connect fails immediately rather than
        // hitting the RPC_DEADLINE timeout path.
        let request = MasterToAgent::GetResources {};
        let err = send_to_node("n1", "127.0.0.1", 1, &request).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport { .. }));
    }

    #[tokio::test]
    async fn agent_error_response_becomes_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _req: Option<MasterToAgent> = read_json_line(&mut reader).await.expect("read");
            let resp = AgentResponse::Error {
                message: "gpu busy".to_string(),
            };
            write_json_line(&mut write_half, &resp).await.expect("write");
        });

        let request = MasterToAgent::GetResources {};
        let err = dispatch("n1", "127.0.0.1", addr.port(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { .. }));
    }
}
