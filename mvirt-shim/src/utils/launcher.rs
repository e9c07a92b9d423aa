//! Start-suspended process launching.
//!
//! A workload is never spawned running. It is spawned through a wrapper that
//! stops itself with SIGSTOP and, once continued, execs the workload in
//! place. The pid is therefore known (and stable) before any workload code
//! runs.

use nix::sys::signal::{Signal, raise};
use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// First argument that switches the shim binary into launch mode.
pub const LAUNCH_ARG: &str = "__launch";

const STOP_THEN_EXEC: &str = "kill -STOP $$; exec \"$@\"";

/// How the stop-then-exec wrapper is provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// Re-execute a shim binary in launch mode.
    Reexec(PathBuf),
    /// Let a POSIX shell stop itself, then exec the workload.
    Shell(PathBuf),
}

impl Default for Launcher {
    fn default() -> Self {
        Launcher::Shell(PathBuf::from("/bin/sh"))
    }
}

impl Launcher {
    /// Re-execute the running binary.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Launcher::Reexec(std::env::current_exe()?))
    }

    /// Build the command that starts `program args..` suspended.
    pub fn command(&self, program: &Path, args: &[String]) -> Command {
        let mut cmd = match self {
            Launcher::Reexec(shim) => {
                let mut cmd = Command::new(shim);
                cmd.arg(LAUNCH_ARG);
                cmd
            }
            Launcher::Shell(sh) => {
                let mut cmd = Command::new(sh);
                cmd.args(["-c", STOP_THEN_EXEC, "sh"]);
                cmd
            }
        };
        cmd.arg(program).args(args);
        cmd
    }
}

/// Launch mode: stop the current process, then replace it with `args`.
///
/// Only returns on failure.
pub fn exec_suspended(args: Vec<OsString>) -> io::Error {
    let Some((program, args)) = args.split_first() else {
        return io::Error::new(
            io::ErrorKind::InvalidInput,
            "launch mode needs a program to run",
        );
    };

    if let Err(e) = raise(Signal::SIGSTOP) {
        return e.into();
    }

    Command::new(program).args(args).exec()
}
