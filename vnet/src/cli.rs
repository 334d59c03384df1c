//! Parses the command line and runs the controller.
//!
//! Basic usage, bringing up the topology of `lab.json` on a local compute host
//! and logging to a file:
//!
//! ```text
//! cargo run -- --config lab.json --log
//! ```

use crate::{config::Config, logging::initialize_logging, project::Project};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use vnet_core::{
    bridge::UbridgeFactory,
    compute::{ChannelCompute, LOCAL_COMPUTE_ID},
    host::ComputeHost,
    notification::NotificationBus,
    port_manager::PortManager,
    process::TokioLauncher,
    ComputeHandle,
};

/// Stores the different command line arguments.
#[derive(Parser, Debug)]
#[command(version, about = "Runs emulated network topologies")]
pub struct Args {
    /// JSON configuration file. Without one every setting has its default.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Write JSON logs to a timestamped file under ./logs instead of stderr.
    #[arg(short, long)]
    pub log: bool,
    #[arg(long, default_value = "info")]
    pub log_level: Level,
}

/// Boots a compute host in this process and returns the handle reaching it.
pub fn boot_local_compute(
    config: &Config,
    bus: NotificationBus,
    cancel: CancellationToken,
) -> (ChannelCompute, JoinHandle<()>) {
    let compute = &config.compute;
    let launcher = Arc::new(TokioLauncher::new());
    let ports = Arc::new(PortManager::new(
        compute.host.clone(),
        compute.udp_port_range.range(),
        compute.console_port_range.range(),
    ));
    let bridges = Arc::new(UbridgeFactory {
        binary: compute.ubridge_path.clone(),
        launcher: launcher.clone(),
        ports: ports.clone(),
        reply_timeout: compute.bridge_reply_timeout(),
        stop_timeout: compute.stop_timeout(),
    });
    let host = Arc::new(ComputeHost::new(
        compute.host_settings(),
        ports,
        launcher,
        bridges,
        bus,
    ));
    host.serve(LOCAL_COMPUTE_ID, config.controller.rpc_timeout(), cancel)
}

/// Logs every event published on `bus` until the bus goes away.
fn follow_events(bus: &NotificationBus) -> JoinHandle<()> {
    let mut queue = bus.queue();
    tokio::spawn(async move {
        while let Some(notification) = queue.next().await {
            tracing::info!(action = %notification.action, event = %notification.event, "Notification");
        }
    })
}

/// Runs the controller until Ctrl-C.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(path) = initialize_logging(args.log, args.log_level)? {
        println!("Logging to {}", path.display());
    }

    let cancel = CancellationToken::new();
    let compute_bus = NotificationBus::default();
    let controller_bus = NotificationBus::default();
    let followers = [follow_events(&compute_bus), follow_events(&controller_bus)];
    let (compute, host) = boot_local_compute(&config, compute_bus, cancel.clone());
    let compute: Arc<dyn ComputeHandle> = Arc::new(compute);

    let mut project = Project::build(compute, &config.controller.topology, controller_bus).await?;
    project.start_all().await?;
    tracing::info!(project = %project.id(), nodes = project.nodes().len(), links = project.links().len(), "Topology running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    project.close().await;
    drop(project);

    cancel.cancel();
    host.await?;
    for follower in followers {
        if tokio::time::timeout(Duration::from_secs(1), follower).await.is_err() {
            tracing::debug!("Event follower still running at exit");
        }
    }
    Ok(())
}
