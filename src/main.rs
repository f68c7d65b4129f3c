use std::path::PathBuf;
use std::sync::Arc;

use collaboration_core::controller::{CollaborationController, Collaborators};
use collaboration_core::ipc::{
    CommandServer, IpcActionExecutor, IpcCartesianPoseSource, IpcGazeController,
    IpcReactiveController,
};
use collaboration_core::{CollaborationConfig, SledWorldModel};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        error!(error = %e, "collaboration daemon failed");
        std::process::exit(1);
    }
}

async fn run() -> collaboration_core::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CollaborationConfig::load(config_path.as_deref())?;
    info!(name = %config.name, robot = %config.robot, part = %config.part, "configuration loaded");

    let world = SledWorldModel::open(&config.world.path)?;
    let collaborators = Collaborators {
        reactive: Arc::new(IpcReactiveController::new(config.ipc.reactive_controller.clone())),
        poses: Arc::new(IpcCartesianPoseSource::new(config.ipc.cartesian.clone())),
        executor: Arc::new(IpcActionExecutor::new(config.ipc.action_executor.clone())),
        gaze: Arc::new(IpcGazeController::new(config.ipc.gaze.clone())),
    };
    let controller = Arc::new(CollaborationController::new(
        &config,
        Arc::new(world),
        collaborators,
    )?);

    let startup_gaze = controller.prepare_gaze().await?;

    let mut server = CommandServer::bind(&config.ipc.command_socket)?;
    server.spawn(controller.clone(), tokio::runtime::Handle::current())?;
    info!(socket = server.name(), "serving collaboration commands");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down");
    }

    controller.shutdown(startup_gaze).await?;
    drop(server);
    // The accept loop is still blocked on the listener; leave without joining it.
    std::process::exit(0)
}
