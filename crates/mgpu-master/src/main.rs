#![allow(clippy::expect_used)]
//! Mgpu-master binary entrypoint.
//!
//! The cluster scheduler that places and dispatches GPU jobs onto
//! registered `mgpu-node` agents.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use mgpu_master::{ClusterConfig, Master};

/// Mgpu-master - GPU cluster job scheduler
#[derive(Parser, Debug, Clone)]
#[command(name = "mgpu-master")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Address to bind the master's TCP listener on.
    #[arg(short, long, env = "MGPU_MASTER_BIND", default_value = "0.0.0.0:9500")]
    pub bind: SocketAddr,

    /// Path to the cluster config file (YAML).
    ///
    /// When omitted, a default single-node localhost entry is used.
    #[arg(short, long, env = "MGPU_MASTER_CLUSTER_CONFIG")]
    pub cluster_config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Cli {
    /// Load the cluster config named on the command line, or the
    /// default single-node entry if none was given.
    ///
    /// # Errors
    ///
    /// Returns an error if a config path was given but could not be
    /// read or parsed.
    pub fn build_config(&self) -> Result<ClusterConfig, mgpu_master::error::ConfigError> {
        match &self.cluster_config {
            Some(path) => ClusterConfig::load(path),
            None => Ok(ClusterConfig::default_single_node()),
        }
    }
}

/// Initialize tracing/logging based on verbosity.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("mgpu_master=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mgpu_master=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.verbose);
    info!("mgpu-master starting...");

    let config = cli.build_config()?;
    info!(nodes = config.nodes.len(), "cluster config loaded");

    let master = Arc::new(Master::new(config));

    let scheduler_handle = tokio::spawn(mgpu_master::scheduler::run(Arc::clone(&master)));
    let monitor_handle = tokio::spawn(mgpu_master::monitor::run(Arc::clone(&master)));
    let server_handle = tokio::spawn(mgpu_master::server::run(Arc::clone(&master), cli.bind));

    tokio::select! {
        res = scheduler_handle => res.map_err(anyhow::Error::from)?,
        res = monitor_handle => res.map_err(anyhow::Error::from)?,
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
        eprintln!("mgpu-master error: {e}");
        std::process::exit(1);
    }
}
