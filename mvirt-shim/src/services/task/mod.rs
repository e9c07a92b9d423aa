//! Task Service - task lifecycle state machine.
//!
//! A task moves `Absent -> Created -> Running -> Exited -> Deleted`:
//! - `create` spawns the workload suspended and registers it
//! - `start` resumes it
//! - the reaper marks it exited
//! - `delete` forgets it
//!
//! Blocking calls (`kill`, `wait`) take a cancellation future and never
//! hold the registry lock while they block.

pub mod api;
pub mod completion;
pub mod registry;
pub mod supervisor;

pub use api::TaskApiHandler;
pub use completion::Completion;
pub use registry::{ExitInfo, TaskRegistry, TaskSnapshot};
pub use supervisor::{Supervisor, Suspension};

use crate::Config;
use crate::bundle::ResolvedConfig;
use crate::error::{Error, Result};
use crate::services::shutdown::Shutdown;
use crate::utils::fifo::{StdioPaths, TaskIo};
use crate::utils::{pidfile, signals};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use registry::TaskRecord;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Parameters of a create call.
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub id: String,
    pub bundle: PathBuf,
    pub stdio: StdioPaths,
}

/// The task lifecycle service.
#[derive(Debug)]
pub struct TaskService {
    config: Config,
    registry: Arc<TaskRegistry>,
    supervisor: Supervisor,
    shutdown: Shutdown,
    /// Serializes creates so the existence check and the insert are atomic.
    create_lock: Mutex<()>,
}

impl TaskService {
    pub fn new(config: Config, shutdown: Shutdown) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let supervisor = Supervisor::new(
            config.launcher.clone(),
            registry.clone(),
            shutdown.clone(),
        );
        Self {
            config,
            registry,
            supervisor,
            shutdown,
            create_lock: Mutex::new(()),
        }
    }

    /// Create a task: resolve the bundle, wire its streams, spawn it
    /// suspended, persist its pid and register it.
    ///
    /// Returns the init pid once the process is known to be suspended (or
    /// already gone). A failed create leaves nothing behind.
    pub async fn create(&self, req: CreateTask) -> Result<u32> {
        validate_id(&req.id)?;

        let _guard = self.create_lock.lock().await;
        if self.registry.contains(&req.id) {
            return Err(Error::AlreadyExists(req.id));
        }

        let bundle = ResolvedConfig::read(&req.bundle, &self.config.interpreter.extensions)?;
        let workload = bundle.workload(&self.config.interpreter);
        debug!("Task {}: resolved workload {:?}", req.id, workload);

        let io = TaskIo::open(&req.stdio)?;
        let pid = self.supervisor.spawn(&req.id, &workload, io)?;

        let pid_file = pidfile::path(&self.config.state_dir, &req.id);
        if let Err(e) = pidfile::write(&pid_file, pid) {
            self.supervisor.discard(pid);
            return Err(io::Error::new(
                e.kind(),
                format!("writing pid file {}: {e}", pid_file.display()),
            )
            .into());
        }

        let record = TaskRecord::new(
            req.id.clone(),
            pid,
            req.bundle.display().to_string(),
            req.stdio,
        );
        if let Err(e) = self.registry.insert(record) {
            self.supervisor.discard(pid);
            return Err(e);
        }

        match self.supervisor.arm(&req.id, pid).await {
            Ok(Suspension::Stopped) => {}
            Ok(Suspension::Exited) => {
                warn!("Task {}: init process {pid} exited during create", req.id)
            }
            Err(e) => {
                let _ = self.registry.remove(&req.id);
                return Err(e);
            }
        }

        info!("Task {} created with init process {pid}", req.id);
        Ok(pid)
    }

    /// Resume the suspended init process.
    pub fn start(&self, id: &str) -> Result<u32> {
        self.registry.with_task(id, |task| -> Result<u32> {
            if task.is_complete() {
                warn!("Task {id}: init process {} already exited", task.pid());
            } else {
                signals::resume(task.pid() as i32)?;
                info!("Task {id} started");
            }
            Ok(task.pid())
        })?
    }

    /// Deliver `signal` (0 means SIGKILL) and block until the task exits or
    /// `cancel` resolves.
    pub async fn kill(
        &self,
        id: &str,
        signal: u32,
        cancel: impl Future<Output = ()>,
    ) -> Result<()> {
        let signal = signals::from_raw(signal).map_err(|e| {
            Error::InvalidArgument(format!("signal {signal}: {e}"))
        })?;

        // Signal under the shared lock: the pid cannot be reaped and reused
        // while it is held.
        let completion = self.registry.with_task(id, |task| -> Result<Option<Completion>> {
            if task.is_complete() {
                return Ok(None);
            }

            let pid = task.pid() as i32;
            debug!("Task {id}: kill pid {pid} with {signal}");
            if signals::is_process_alive(pid) {
                signals::send(pid, signal).inspect_err(|e| {
                    error!("Task {id}: failed to send {signal} to init process {pid}: {e}")
                })?;
                if signal != Signal::SIGKILL {
                    // A still-suspended task only acts on the signal once continued.
                    if let Err(e) = signals::resume(pid) {
                        debug!("Task {id}: failed to continue init process {pid}: {e}");
                    }
                }
            }
            Ok(Some(task.completion().clone()))
        })??;

        let Some(completion) = completion else {
            warn!("Task {id} already exited");
            return Ok(());
        };
        until_complete(&completion, cancel).await
    }

    /// Block until the task exits or `cancel` resolves.
    pub async fn wait(&self, id: &str, cancel: impl Future<Output = ()>) -> Result<ExitInfo> {
        let completion = self.registry.completion(id)?;
        until_complete(&completion, cancel).await?;

        self.registry.get(id)?.exit.ok_or_else(|| {
            Error::FailedPrecondition(format!("task {id} has no exit status"))
        })
    }

    /// Snapshot of the task.
    pub fn state(&self, id: &str) -> Result<TaskSnapshot> {
        self.registry.get(id)
    }

    /// Forget an exited task, returning its pid and exit.
    pub fn delete(&self, id: &str) -> Result<(u32, ExitInfo)> {
        let (pid, exit) = self.registry.remove(id)?;
        info!("Task {id} deleted (pid {pid}, exit status {})", exit.status);
        Ok((pid, exit))
    }

    /// Shim pid and task pid.
    pub fn connect(&self, id: &str) -> Result<(u32, u32)> {
        let task_pid = self.registry.with_task(id, |task| task.pid())?;
        Ok((std::process::id(), task_pid))
    }

    /// Request shim shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.shutdown() {
            debug!("Shutdown already requested");
        }
    }
}

async fn until_complete(completion: &Completion, cancel: impl Future<Output = ()>) -> Result<()> {
    tokio::select! {
        biased;
        () = completion.wait() => Ok(()),
        () = cancel => Err(Error::Cancelled),
    }
}

/// Task ids name a directory under the state dir, so they must be a single
/// plain path component.
fn validate_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == id => Ok(()),
        _ => Err(Error::InvalidArgument(format!("invalid task id {id:?}"))),
    }
}
