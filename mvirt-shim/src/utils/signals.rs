//! Signal helpers for supervised processes.

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Check whether a process exists.
///
/// POSIX specifies that the null signal can be sent to check whether a pid
/// is valid.
pub fn is_process_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

/// Deliver `signal` to `pid`.
pub fn send(pid: i32, signal: Signal) -> Result<(), Errno> {
    debug!("Sending {} to pid {}", signal, pid);
    kill(Pid::from_raw(pid), signal)
}

/// Resume a stopped process.
pub fn resume(pid: i32) -> Result<(), Errno> {
    send(pid, Signal::SIGCONT)
}

/// Map a signal number from the wire to a signal, treating 0 as SIGKILL.
pub fn from_raw(signal: u32) -> Result<Signal, Errno> {
    if signal == 0 {
        return Ok(Signal::SIGKILL);
    }
    i32::try_from(signal)
        .map_err(|_| Errno::EINVAL)
        .and_then(Signal::try_from)
}
