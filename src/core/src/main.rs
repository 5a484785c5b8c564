use std::path::PathBuf;
use std::sync::Arc;

use berth::boot::BootCoordinator;
use berth::configuration::Config;
use berth::container_runtime::{ContainerRuntime, DockerCli};
use berth::control_plane::{ControlPlane, PanelClient};
use berth::monitor::ContainerMonitor;
use berth::orchestrator::Orchestrator;
use berth::volume::{FsVolumePreparer, VolumePreparer};
use clap::Parser;
use log::{error, info, warn};

#[derive(Parser)]
#[command(name = "berth")]
#[command(version = "0.1.0")]
#[command(about = "Node daemon running game server instances in containers")]
struct Args {
    /// Path of the TOML configuration file
    #[arg(env = "BERTH_CONFIG", default_value = "/etc/berth/config.toml")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("Importing configuration from {}", args.config_file.display());
    let config = match Config::from_file(&args.config_file) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration imported successfully");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(&config.docker.binary));
    let control_plane: Arc<dyn ControlPlane> = match PanelClient::new(&config.remote) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Unable to create the panel client: {}", e);
            std::process::exit(1);
        }
    };
    let volumes: Arc<dyn VolumePreparer> = Arc::new(FsVolumePreparer::new());

    let monitor = ContainerMonitor::new(Arc::clone(&runtime), &config.monitor);
    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&runtime),
        Arc::clone(&control_plane),
        volumes,
    );
    let _workers = orchestrator.spawn_workers(monitor.subscribe());
    let monitor_task = monitor.spawn();

    let coordinator = BootCoordinator::new(Arc::clone(&orchestrator), control_plane, runtime);
    if let Err(e) = coordinator.boot().await {
        warn!("Continuing without a completed boot: {}", e);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    monitor.shutdown();
    if let Err(e) = monitor_task.await {
        error!("Error joining the container monitor: {:?}", e);
    }
    orchestrator.clear().await;
}
