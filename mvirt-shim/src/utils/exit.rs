//! Exit status decoding.

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;

/// Added to the signal number when a process was killed by a signal.
///
/// <https://pubs.opengroup.org/onlinepubs/9699919799/utilities/V3_chap02.html#tag_18_21_18>
pub const EXIT_CODE_SIGNAL_BASE: u32 = 128;

/// Reported when the OS could not tell how a process ended.
pub const EXIT_STATUS_UNKNOWN: u32 = 255;

/// Normalize the result of waiting on a terminated process into an exit code.
///
/// A natural exit keeps its code, a signal death maps to `128 + signal`, and
/// anything else (no status, or a non-terminal status) maps to 255.
pub fn decode(status: Result<WaitStatus, Errno>) -> u32 {
    match status {
        Ok(WaitStatus::Exited(_, code)) => code as u32 & 0xff,
        Ok(WaitStatus::Signaled(_, signal, _)) => EXIT_CODE_SIGNAL_BASE + signal as u32,
        Ok(_) | Err(_) => EXIT_STATUS_UNKNOWN,
    }
}
