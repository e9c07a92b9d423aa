//! Process Supervisor - spawns workloads suspended and reaps them.
//!
//! Every task process gets one reaper thread that lives exactly as long as
//! the process. The reaper observes the suspension, then the exit, without
//! consuming either; the pid is released with `waitpid` only while the
//! registry's exclusive lock is held, together with the exit record.

use super::registry::TaskRegistry;
use crate::bundle::Workload;
use crate::error::Result;
use crate::services::shutdown::Shutdown;
use crate::utils::fifo::TaskIo;
use crate::utils::launcher::Launcher;
use crate::utils::{exit, signals};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use std::io;
use std::sync::Arc;
use tokio::sync::oneshot;

/// What the reaper saw first after a spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// The wrapper stopped itself and waits for a resume.
    Stopped,
    /// The process ended before it could stop.
    Exited,
}

/// Spawns task processes and owns their reapers.
#[derive(Debug)]
pub struct Supervisor {
    launcher: Launcher,
    registry: Arc<TaskRegistry>,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(launcher: Launcher, registry: Arc<TaskRegistry>, shutdown: Shutdown) -> Self {
        Self {
            launcher,
            registry,
            shutdown,
        }
    }

    /// Spawn `workload` suspended with its streams wired to `io`.
    ///
    /// The process is not waited on here: the caller must either [`arm`] a
    /// reaper for the returned pid or [`discard`] it.
    ///
    /// [`arm`]: Supervisor::arm
    /// [`discard`]: Supervisor::discard
    pub fn spawn(&self, id: &str, workload: &Workload, io: TaskIo) -> Result<u32> {
        let mut cmd = self.launcher.command(&workload.program, &workload.args);
        cmd.current_dir(&workload.cwd)
            .envs(workload.env.iter().map(|(k, v)| (k, v)));
        io.configure(&mut cmd);

        debug!("Task {id}: spawning {cmd:?}");
        let mut child = cmd
            .spawn()
            .map_err(|e| io::Error::new(e.kind(), format!("running init command: {e}")))?;
        let pid = child.id();
        io.attach(id, &mut child);

        // Dropping a std Child neither waits nor kills.
        drop(child);

        info!("Task {id}: init process {pid} spawned");
        Ok(pid)
    }

    /// Start the reaper for `pid` and wait until it has seen the process
    /// stop (or exit).
    ///
    /// The task must already be registered under `id`. If no reaper can be
    /// started the process is killed and its exit recorded before the error
    /// is returned.
    pub async fn arm(&self, id: &str, pid: u32) -> Result<Suspension> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let reaper = Reaper {
            id: id.to_string(),
            pid: Pid::from_raw(pid as i32),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("reaper-{pid}"))
            .spawn(move || reaper.run(ready_tx));

        if let Err(e) = spawned {
            error!("Task {id}: failed to start reaper for init process {pid}: {e}");
            let _ = self
                .registry
                .complete(id, || kill_and_reap(Pid::from_raw(pid as i32)));
            return Err(e.into());
        }

        Ok(ready_rx.await.unwrap_or(Suspension::Exited))
    }

    /// Kill and reap a spawned process that no task record refers to.
    pub fn discard(&self, pid: u32) {
        let pid = Pid::from_raw(pid as i32);
        warn!("Discarding init process {pid}");
        let status = kill_and_reap(pid);
        debug!("Init process {pid} discarded with status {status}");
    }
}

struct Reaper {
    id: String,
    pid: Pid,
    registry: Arc<TaskRegistry>,
    shutdown: Shutdown,
}

impl Reaper {
    fn run(self, ready: oneshot::Sender<Suspension>) {
        let id = &self.id;
        let pid = self.pid;

        let first = wait_no_reap(
            pid,
            WaitPidFlag::WSTOPPED | WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        );
        let suspension = match first {
            Ok(WaitStatus::Stopped(_, signal)) => {
                debug!("Task {id}: init process {pid} suspended by {signal}");
                Suspension::Stopped
            }
            Ok(status) => {
                warn!("Task {id}: init process {pid} ended before it was started: {status:?}");
                Suspension::Exited
            }
            Err(e) => {
                error!("Task {id}: failed to wait for init process {pid}: {e}");
                Suspension::Exited
            }
        };
        let _ = ready.send(suspension);

        let exited = match suspension {
            Suspension::Stopped => wait_no_reap(pid, WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT),
            Suspension::Exited => first,
        };
        // Never block under the registry lock on a process we lost track of.
        let reap_flags = match exited {
            Ok(_) => None,
            Err(e) => {
                warn!("Task {id}: lost track of init process {pid}: {e}");
                Some(WaitPidFlag::WNOHANG)
            }
        };
        debug!("Task {id}: init process {pid} exited");

        let mut status = exit::EXIT_STATUS_UNKNOWN;
        let recorded = self.registry.complete(id, || {
            status = exit::decode(waitpid(pid, reap_flags));
            status
        });

        match recorded {
            Ok(all_done) => {
                info!("Task {id}: init process {pid} exited with status {status}");
                if all_done {
                    debug!("All tasks exited, shutting down the shim");
                    self.shutdown.shutdown();
                }
            }
            Err(e) => warn!("Task {id}: failed to write final status of init process {pid}: {e}"),
        }
    }
}

/// Block until `pid` changes state as selected by `flags`, retrying on EINTR.
fn wait_no_reap(pid: Pid, flags: WaitPidFlag) -> nix::Result<WaitStatus> {
    loop {
        match waitid(Id::Pid(pid), flags) {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

fn kill_and_reap(pid: Pid) -> u32 {
    if let Err(e) = signals::send(pid.as_raw(), Signal::SIGKILL) {
        warn!("Failed to kill pid {pid}: {e}");
    }
    exit::decode(waitpid(pid, None))
}
