//! mvirt-shim - per-container task shim.
//!
//! A long-lived agent, started once per container, that supervises the
//! container's workload process and exposes the task API over gRPC on a
//! Unix domain socket.
//!
//! ## Architecture
//!
//! - **Task Service**: lifecycle state machine behind the task API
//! - **Supervisor**: spawns workloads suspended and reaps them
//! - **Manager**: bootstraps a detached shim and force-stops it
//!
//! The shim shuts itself down once every task it supervises has exited, or
//! when asked to.

pub mod bundle;
pub mod error;
pub mod manager;
pub mod services;
pub mod utils;

pub mod proto {
    tonic::include_proto!("mvirt.shim");
}

use crate::proto::task_server::TaskServer;
use crate::services::shutdown::Shutdown;
use crate::services::task::{TaskApiHandler, TaskService};
use crate::utils::launcher::Launcher;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

/// Fallback state directory when the working directory has no parent.
const DEFAULT_STATE_DIR: &str = "/run/mvirt-shim";

/// Program that runs workload files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    /// Interpreter binary.
    pub program: PathBuf,
    /// Arguments placed before the workload file.
    pub args: Vec<String>,
    /// Accepted workload file extensions. Empty accepts any file.
    pub extensions: Vec<String>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/bin/sh"),
            args: Vec::new(),
            extensions: vec!["sh".to_string()],
        }
    }
}

/// Configuration for the task service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `<id>/init.pid`.
    pub state_dir: PathBuf,
    /// How workloads are started suspended.
    pub launcher: Launcher,
    pub interpreter: Interpreter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            launcher: Launcher::default(),
            interpreter: Interpreter::default(),
        }
    }
}

/// The shim runs inside the bundle directory; task state lives next to it.
pub fn default_state_dir() -> PathBuf {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| cwd.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

/// Serve the task API on `listener` until `shutdown` fires.
pub async fn serve(
    listener: UnixListener,
    service: Arc<TaskService>,
    shutdown: Shutdown,
) -> Result<(), tonic::transport::Error> {
    let handler = TaskApiHandler::new(service);

    Server::builder()
        .add_service(TaskServer::new(handler))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown.wait())
        .await?;

    info!("Task API server stopped");
    Ok(())
}
