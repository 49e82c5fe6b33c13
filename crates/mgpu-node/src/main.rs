#![allow(clippy::expect_used)]
//! Mgpu-node binary entrypoint.
//!
//! The per-node agent that owns a machine's GPUs and executes jobs
//! dispatched by `mgpu-master`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use mgpu_node::config::NodeConfig;
use mgpu_node::inventory::NvidiaSmiProbe;
use mgpu_node::{server, Agent};

/// Mgpu-node - per-machine GPU scheduler agent
#[derive(Parser, Debug, Clone)]
#[command(name = "mgpu-node")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Operator-assigned node id, echoed to the master on registration.
    #[arg(long, env = "MGPU_NODE_ID")]
    pub node_id: Option<String>,

    /// Address to bind the agent's TCP listener on.
    #[arg(short, long, env = "MGPU_NODE_BIND", default_value = "0.0.0.0:9600")]
    pub bind: SocketAddr,

    /// Hostname or IP the master should dial to reach this agent.
    /// Defaults to the bind address's own host when not given.
    #[arg(long, env = "MGPU_NODE_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// The master's hostname or IP.
    #[arg(long, env = "MGPU_NODE_MASTER_HOST")]
    pub master_host: Option<String>,

    /// The master's TCP port.
    #[arg(long, env = "MGPU_NODE_MASTER_PORT")]
    pub master_port: Option<u16>,

    /// Path to a JSON node config file.
    #[arg(short, long, env = "MGPU_NODE_CONFIG")]
    pub config: Option<PathBuf>,

    /// GPU memory-utilization percentage below which a GPU counts as
    /// free when the agent starts up.
    #[arg(long, env = "MGPU_NODE_GPU_UTIL_THRESHOLD")]
    pub gpu_util_threshold: Option<f64>,

    /// Seconds between heartbeats sent to the master.
    #[arg(long, env = "MGPU_NODE_HEARTBEAT_SECS")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    /// Build a [`NodeConfig`] by loading the config file, if given, and
    /// then overriding it field-by-field with any CLI flags present.
    ///
    /// # Errors
    ///
    /// Returns an error if a config path was given but could not be
    /// read or parsed, or if no node id was supplied by either source.
    pub fn build_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(host) = &self.advertise_host {
            config.advertise_host = host.clone();
        } else {
            config.advertise_host = self.bind.ip().to_string();
        }
        if let Some(host) = &self.master_host {
            config.master_host = host.clone();
        }
        if let Some(port) = self.master_port {
            config.master_port = port;
        }
        if let Some(threshold) = self.gpu_util_threshold {
            config.gpu_utilization_threshold_percent = threshold;
        }
        if let Some(secs) = self.heartbeat_interval_secs {
            config.heartbeat_interval_secs = secs;
        }

        if config.node_id.is_empty() {
            anyhow::bail!("a node id is required: pass --node-id or set it in the config file");
        }

        Ok(config)
    }
}

/// Initialize tracing/logging based on verbosity.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("mgpu_node=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mgpu_node=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.verbose);
    info!("mgpu-node starting...");

    let config = cli.build_config()?;
    let probe = NvidiaSmiProbe::new();
    let agent = Arc::new(Agent::new(config.clone(), &probe)?);
    let gpu_count = agent.gpu_count().await;
    info!(node_id = %config.node_id, gpu_count, "gpu inventory probed");

    let listener = server::bind(cli.bind).await?;
    let local_addr = listener.local_addr()?;

    agent.register(local_addr.port()).await?;
    info!(node_id = %config.node_id, %local_addr, "registered with master");

    let heartbeat_agent = Arc::clone(&agent);
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(heartbeat_agent.config.heartbeat_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = heartbeat_agent.heartbeat().await {
                warn!(error = %e, "heartbeat failed");
            }
        }
    });

    let server_handle = tokio::spawn(server::serve(Arc::clone(&agent), listener));

    tokio::select! {
        res = heartbeat_handle => res.map_err(anyhow::Error::from)?,
        res = server_handle => res.map_err(anyhow::Error::from)?.map_err(anyhow::Error::from)?,
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("mgpu-node error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse_args(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut full_args = vec!["mgpu-node"];
        full_args.extend(args);
        Cli::try_parse_from(full_args)
    }

    #[test]
    fn default_bind_address() {
        let cli = parse_args(&[]).expect("should parse empty args");
        assert_eq!(cli.bind.port(), 9600);
        assert!(cli.node_id.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn parses_node_id_and_master_address() {
        let cli = parse_args(&["--node-id", "n1", "--master-host", "10.0.0.1", "--master-port", "9500"])
            .expect("should parse");
        assert_eq!(cli.node_id, Some("n1".to_string()));
        assert_eq!(cli.master_host, Some("10.0.0.1".to_string()));
        assert_eq!(cli.master_port, Some(9500));
    }

    #[test]
    fn build_config_requires_a_node_id() {
        let cli = parse_args(&[]).expect("should parse");
        let err = cli.build_config().unwrap_err();
        assert!(err.to_string().contains("node id is required"));
    }

    #[test]
    fn build_config_applies_cli_overrides() {
        let cli = parse_args(&[
            "--node-id",
            "n1",
            "--master-host",
            "10.0.0.1",
            "--master-port",
            "9500",
            "--gpu-util-threshold",
            "25",
        ])
        .expect("should parse");
        let config = cli.build_config().expect("builds");
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.master_host, "10.0.0.1");
        assert_eq!(config.master_port, 9500);
        assert!((config.gpu_utilization_threshold_percent - 25.0).abs() < f64::EPSILON);
    }
}
