//! Shim Manager - bootstrap and force-stop.
//!
//! `start` runs in a short-lived process invoked by the host: it binds the
//! task API socket, hands it to a detached `serve` child as fd 3 and reports
//! where the child listens. `stop` is the host's last resort when the API is
//! gone: it kills the init process recorded in the pid file.

use crate::error::Result;
use crate::utils::exit::EXIT_CODE_SIGNAL_BASE;
use crate::utils::{pidfile, signals};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::Signal;
use nix::unistd::Uid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Descriptor the listening socket is passed on.
pub const SOCKET_FD: RawFd = 3;

pub const SOCKET_FILE: &str = "shim.sock";

/// Version of the bootstrap parameters format.
pub const BOOTSTRAP_VERSION: u32 = 2;

pub const PROTOCOL: &str = "grpc";

const OOM_SCORE_ADJ_MAX: i32 = 1000;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where a started shim can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapParams {
    pub version: u32,
    pub address: String,
    pub protocol: String,
}

/// Outcome of a forced stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopStatus {
    pub pid: i32,
    pub exited_at: DateTime<Utc>,
    pub exit_status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
}

/// Parameters for [`start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Shim binary to run in serve mode.
    pub shim: PathBuf,
    pub id: String,
    /// Socket path to listen on.
    pub socket: PathBuf,
    pub debug: bool,
    /// Extra global flags forwarded to the child.
    pub args: Vec<String>,
}

/// Default socket location for task `id`.
pub fn socket_path(state_dir: &Path, id: &str) -> PathBuf {
    state_dir.join(id).join(SOCKET_FILE)
}

/// Start a detached shim serving on `opts.socket`.
pub fn start(opts: &StartOptions) -> Result<BootstrapParams> {
    if let Some(dir) = opts.socket.parent() {
        fs::create_dir_all(dir)?;
    }
    let listener = bind(&opts.socket)?;
    let fd = listener.as_raw_fd();

    let mut cmd = Command::new(&opts.shim);
    cmd.arg("--id").arg(&opts.id);
    if opts.debug {
        cmd.arg("--debug");
    }
    cmd.args(&opts.args)
        .arg("serve")
        .arg("--socket-fd")
        .arg(SOCKET_FD.to_string())
        .arg("--socket")
        .arg(&opts.socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: only async-signal-safe libc calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if fd == SOCKET_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(fd, SOCKET_FD) == -1 {
                return Err(io::Error::last_os_error());
            }
            // Detach from the caller's session so its signals do not reach us.
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        io::Error::new(e.kind(), format!("starting shim command: {e}"))
    })?;
    drop(listener);

    let pid = child.id();
    info!("Started shim {pid} for task {}", opts.id);

    std::thread::spawn(move || {
        if let Err(e) = child.wait() {
            warn!("Failed to wait for shim process {pid}: {e}");
        }
    });

    adjust_oom_score(pid)?;

    Ok(BootstrapParams {
        version: BOOTSTRAP_VERSION,
        address: format!("unix://{}", opts.socket.display()),
        protocol: PROTOCOL.to_string(),
    })
}

/// Kill the init process of task `id` recorded under `state_dir`.
pub fn stop(state_dir: &Path, id: &str) -> Result<StopStatus> {
    let pid_file = pidfile::path(state_dir, id);
    let pid = pidfile::read(&pid_file).map_err(|e| {
        io::Error::new(e.kind(), format!("reading pid file {}: {e}", pid_file.display()))
    })?;

    if signals::is_process_alive(pid) {
        if let Err(e) = signals::send(pid, Signal::SIGKILL) {
            warn!("Failed to send kill syscall to init process {pid}: {e}");
        }
    } else {
        debug!("Init process {pid} of task {id} is already gone");
    }

    Ok(StopStatus {
        pid,
        exited_at: Utc::now(),
        exit_status: EXIT_CODE_SIGNAL_BASE + Signal::SIGKILL as u32,
    })
}

pub fn info() -> RuntimeInfo {
    RuntimeInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: VERSION.to_string(),
    }
}

fn bind(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            // A socket nobody accepts on is left over from a dead shim.
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("shim socket {} is in use", path.display()),
                ));
            }
            debug!("Removing stale socket {}", path.display());
            fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        result => result,
    }
}

/// Prepare the listening socket inherited from [`start`] for serving.
///
/// [`start`] clears close-on-exec so the socket survives into the shim;
/// it is set again here so workloads do not inherit it.
pub fn adopt_listener(listener: UnixListener) -> io::Result<UnixListener> {
    fcntl(listener.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// The shim should be killed before its tasks under memory pressure.
pub fn oom_score_for_child(own: i32) -> i32 {
    (own + 1).min(OOM_SCORE_ADJ_MAX)
}

fn adjust_oom_score(pid: u32) -> io::Result<()> {
    let own: i32 = fs::read_to_string("/proc/self/oom_score_adj")?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let score = oom_score_for_child(own);

    match fs::write(format!("/proc/{pid}/oom_score_adj"), score.to_string()) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && !Uid::effective().is_root() => {
            debug!("Not permitted to set OOM score of shim {pid}: {e}");
            Ok(())
        }
        result => result.map_err(|e| {
            io::Error::new(e.kind(), format!("adjusting shim process OOM score: {e}"))
        }),
    }
}
