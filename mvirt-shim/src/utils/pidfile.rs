//! Init process pid files.
//!
//! When the RPC channel is gone, the host can only find a task's init
//! process through the pid file written at create time.

use log::debug;
use nix::unistd::{Gid, Uid, chown};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const INIT_PID_FILE: &str = "init.pid";

/// Location of the pid file for task `id`.
pub fn path(state_dir: &Path, id: &str) -> PathBuf {
    state_dir.join(id).join(INIT_PID_FILE)
}

/// Atomically write `pid` to `path`, readable by everyone and owned by root.
pub fn write(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let tmp = path.with_extension("pid.tmp");
    fs::write(&tmp, pid.to_string())?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;

    if Uid::effective().is_root() {
        chown(&tmp, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))?;
    } else {
        debug!("Not root, leaving {} owned by current user", path.display());
    }

    fs::rename(&tmp, path)
}

/// Read a pid previously stored with [`write`].
pub fn read(path: &Path) -> io::Result<i32> {
    let data = fs::read_to_string(path)?;
    data.trim().parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid pid file {}: {e}", path.display()),
        )
    })
}
