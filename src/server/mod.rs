// src/server/mod.rs

//! Daemon startup: loads the manifest, builds the role-specific state, and
//! runs the network loops until a shutdown signal arrives.

use crate::config::Config;
use crate::core::SentraError;
use crate::core::cluster::NodeType;
use crate::core::cluster::master::{MasterControl, MasterState};
use crate::core::cluster::worker::{WorkerControl, WorkerState};
use crate::core::control::{self, ControlBackend};
use crate::core::dispatch::{AgentDirectory, EmptyDirectory, FunctionRegistry};
use crate::core::sync::ClusterItems;
use crate::core::sync::apply::AgentRemovalHook;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Process exit codes, as documented for operators.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const BAD_CONFIG: i32 = 2;
    pub const BIND_FAILED: i32 = 3;
    pub const BAD_CRYPTO: i32 = 4;
    pub const FILESYSTEM: i32 = 5;
}

/// Everything the embedder can plug into the runtime: the opaque business
/// functions, the agent registry, and the agent-removal callback.
pub struct Extensions {
    pub registry: FunctionRegistry,
    pub directory: Arc<dyn AgentDirectory>,
    pub agent_removal_hook: Option<AgentRemovalHook>,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            registry: FunctionRegistry::new(),
            directory: Arc::new(EmptyDirectory),
            agent_removal_hook: None,
        }
    }
}

/// Maps a startup error to its process exit code.
pub fn exit_code_for(error: &SentraError) -> i32 {
    match error {
        SentraError::InvalidConfig(_) | SentraError::InvalidManifest(_) => exit_codes::BAD_CONFIG,
        SentraError::InvalidKey(_) | SentraError::BadAuth => exit_codes::BAD_CRYPTO,
        SentraError::Io(e) if e.kind() == std::io::ErrorKind::AddrInUse => exit_codes::BIND_FAILED,
        SentraError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            exit_codes::BIND_FAILED
        }
        SentraError::Io(_) => exit_codes::FILESYSTEM,
        _ => 1,
    }
}

/// The main entry point: runs the node until SIGINT/SIGTERM.
pub async fn run(config: Config, extensions: Extensions) -> Result<(), SentraError> {
    let config = Arc::new(config);
    let cipher = config.cipher()?;
    if cipher.is_some() {
        info!("Payload encryption enabled.");
    } else {
        info!("No cluster key configured; payloads travel in plaintext.");
    }

    let manifest = Arc::new(ClusterItems::from_file(&config.manifest_path)?);
    info!(
        "Loaded cluster-items manifest with {} synchronized directories.",
        manifest.files.len()
    );
    std::fs::create_dir_all(config.data_dir.join("queue/cluster"))?;

    let registry = Arc::new(extensions.registry);
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks = JoinSet::new();

    match config.node_type {
        NodeType::Master => {
            info!(
                "Starting node '{}' as MASTER of cluster '{}'.",
                config.node_name, config.name
            );
            let state = MasterState::new(
                config.clone(),
                manifest,
                registry,
                extensions.directory,
            );
            let backend: Arc<dyn ControlBackend> = Arc::new(MasterControl(state.clone()));
            tasks.spawn(control::run(
                config.control_socket.clone(),
                backend,
                shutdown_tx.subscribe(),
            ));
            tasks.spawn(crate::core::cluster::master::run(
                state,
                cipher,
                shutdown_tx.subscribe(),
            ));
        }
        NodeType::Worker => {
            info!(
                "Starting node '{}' as WORKER of cluster '{}'.",
                config.node_name, config.name
            );
            let state = WorkerState::new(
                config.clone(),
                manifest,
                registry,
                extensions.directory,
                extensions.agent_removal_hook,
            );
            let backend: Arc<dyn ControlBackend> = Arc::new(WorkerControl(state.clone()));
            tasks.spawn(control::run(
                config.control_socket.clone(),
                backend,
                shutdown_tx.subscribe(),
            ));
            tasks.spawn(crate::core::cluster::worker::run(
                state,
                cipher,
                shutdown_tx.subscribe(),
            ));
        }
    }

    tokio::select! {
        _ = await_shutdown_signal() => {
            let _ = shutdown_tx.send(());
        }
        Some(finished) = tasks.join_next() => {
            // A network loop ending early is a startup failure (bad bind,
            // unreadable filesystem); surface it.
            let _ = shutdown_tx.send(());
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Runtime task failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    return Err(SentraError::Internal(format!("runtime task panicked: {e}")));
                }
            }
        }
    }

    while tasks.join_next().await.is_some() {}
    info!("Shutdown complete.");
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn await_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}
