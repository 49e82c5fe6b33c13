//! Job process supervision: building the launch command, spawning the
//! job in its own process group, streaming its output to the master,
//! and killing it on cancellation.

use std::process::Stdio;
use std::sync::Arc;

use mgpu_proto::{DistributedType, JobId};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::SupervisorError;

/// Rendezvous port `torch.distributed` jobs are told to use.
pub const PYTORCH_MASTER_PORT: u16 = 29500;

/// Parameters describing one job launch, gathered here so
/// `spawn_and_supervise`'s signature stays readable.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// The job being launched.
    pub job_id: JobId,
    /// OS user the job runs as.
    pub user: String,
    /// Shell command line to execute.
    pub command: String,
    /// GPU indices reserved for this job on this node.
    pub gpus: Vec<u32>,
    /// Whether output is forwarded to interactive client attachments.
    pub interactive: bool,
    /// Rendezvous rank, for multi-host jobs.
    pub rank: Option<u32>,
    /// Rendezvous world size, for multi-host jobs.
    pub world_size: Option<u32>,
    /// Hostname of the rank-0 node, for multi-host jobs.
    pub master_node: Option<String>,
    /// Rendezvous framework in use.
    pub distributed_type: DistributedType,
}

/// Build the `sudo -u <user> bash -lc '<command>'` line run for a job,
/// with `CUDA_VISIBLE_DEVICES` and, for `pytorch` jobs, the rendezvous
/// environment variables inlined ahead of the user's command. stderr is
/// merged into stdout with a trailing shell redirect so the supervisor
/// only has to read one stream.
#[must_use]
pub fn build_shell_command(spec: &LaunchSpec) -> String {
    let gpu_list = spec
        .gpus
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut env = format!("CUDA_VISIBLE_DEVICES={gpu_list} PYTHONUNBUFFERED=1");

    if spec.distributed_type == DistributedType::Pytorch {
        if let (Some(rank), Some(world_size), Some(master_node)) =
            (spec.rank, spec.world_size, spec.master_node.as_ref())
        {
            env.push_str(&format!(
                " RANK={rank} WORLD_SIZE={world_size} MASTER_ADDR={master_node} MASTER_PORT={PYTORCH_MASTER_PORT}"
            ));
        }
    }

    format!(
        "cd ~{user} && {env} {command} 2>&1",
        user = spec.user,
        env = env,
        command = spec.command,
    )
}

/// Spawn a job's process in its own process group and return its pid.
///
/// Spawns a background task that forwards the process's merged
/// stdout/stderr to the master line by line and, once the process
/// exits, releases its GPUs and reports completion via
/// [`Agent::finish_job`].
///
/// # Errors
///
/// Returns [`SupervisorError::Spawn`] if the process cannot be started.
pub async fn spawn_and_supervise(agent: Arc<Agent>, spec: LaunchSpec) -> Result<u32, SupervisorError> {
    let shell_command = build_shell_command(&spec);
    debug!(job_id = %spec.job_id, %shell_command, "launching job");

    let mut cmd = Command::new("sudo");
    cmd.args(["-u", &spec.user, "bash", "-lc", &shell_command])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| SupervisorError::Spawn("child exited before a pid was assigned".to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SupervisorError::Spawn("child had no stdout pipe".to_string()))?;

    let job_id = spec.job_id;
    let interactive = spec.interactive;

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = agent.send_output(job_id, line, interactive).await {
                        warn!(job_id = %job_id, error = %e, "failed to forward job output to master");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "error reading job output");
                    break;
                }
            }
        }

        let exit_code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to wait on job process");
                -1
            }
        };

        agent.finish_job(job_id, exit_code).await;
    });

    Ok(pid)
}

/// Send `SIGKILL` to a job's process group.
///
/// # Errors
///
/// Returns [`SupervisorError::Kill`] if the signal could not be sent,
/// e.g. the process has already exited.
pub fn kill_process_group(pid: u32) -> Result<(), SupervisorError> {
    let pgid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
    killpg(pgid, Signal::SIGKILL).map_err(|e| SupervisorError::Kill(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(distributed_type: DistributedType) -> LaunchSpec {
        LaunchSpec {
            job_id: JobId::new(),
            user: "ada".to_string(),
            command: "python train.py".to_string(),
            gpus: vec![0, 1],
            interactive: false,
            rank: Some(0),
            world_size: Some(2),
            master_node: Some("gpu-1.cluster.local".to_string()),
            distributed_type,
        }
    }

    #[test]
    fn single_job_gets_no_rendezvous_vars() {
        let cmd = build_shell_command(&spec(DistributedType::Single));
        assert!(cmd.contains("CUDA_VISIBLE_DEVICES=0,1"));
        assert!(!cmd.contains("RANK="));
        assert!(cmd.ends_with("python train.py 2>&1"));
    }

    #[test]
    fn mpi_job_gets_no_rendezvous_vars() {
        let cmd = build_shell_command(&spec(DistributedType::Mpi));
        assert!(!cmd.contains("RANK="));
        assert!(!cmd.contains("MASTER_ADDR"));
    }

    #[test]
    fn pytorch_job_gets_rendezvous_vars() {
        let cmd = build_shell_command(&spec(DistributedType::Pytorch));
        assert!(cmd.contains("RANK=0"));
        assert!(cmd.contains("WORLD_SIZE=2"));
        assert!(cmd.contains("MASTER_ADDR=gpu-1.cluster.local"));
        assert!(cmd.contains("MASTER_PORT=29500"));
    }

    #[test]
    fn command_cds_into_the_users_home_directory() {
        let cmd = build_shell_command(&spec(DistributedType::Single));
        assert!(cmd.starts_with("cd ~ada &&"));
    }
}
