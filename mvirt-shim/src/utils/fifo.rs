//! Named pipe wiring for task standard streams.
//!
//! The host hands the shim up to three FIFO paths. Each one is validated and
//! opened before the workload is spawned, the process gets plain pipes for
//! its streams, and one copy loop per stream shovels bytes between the two.
//! A broken pipe only ends its own copy loop; it never fails the task.

use log::{debug, error};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;

/// FIFO paths for a task's standard streams. Empty means "not wired".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioPaths {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
}

impl StdioPaths {
    /// Path stderr is written to. An unset stderr shares the stdout FIFO.
    pub fn stderr_path(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Fail with an I/O error unless `path` names a FIFO.
pub fn ensure_fifo(path: &Path) -> io::Result<()> {
    let metadata = fs::metadata(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("checking whether {} is a fifo: {e}", path.display()),
        )
    })?;

    if !metadata.file_type().is_fifo() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("file {} is not a fifo", path.display()),
        ));
    }
    Ok(())
}

/// Opened FIFO endpoints for one task.
#[derive(Debug, Default)]
pub struct TaskIo {
    stdin: Option<pipe::Receiver>,
    stdout: Option<pipe::Sender>,
    stderr: Option<pipe::Sender>,
}

impl TaskIo {
    /// Validate and open every configured FIFO without blocking.
    ///
    /// The writing ends need a reader on the other side, which the host
    /// opens before asking for a task.
    pub fn open(paths: &StdioPaths) -> io::Result<Self> {
        Ok(Self {
            stdin: open_if_set(&paths.stdin, open_reader)?,
            stdout: open_if_set(&paths.stdout, open_writer)?,
            stderr: open_if_set(paths.stderr_path(), open_writer)?,
        })
    }

    /// Point the command's standard streams at pipes or `/dev/null`.
    pub fn configure(&self, cmd: &mut Command) {
        cmd.stdin(piped_or_null(self.stdin.is_some()));
        cmd.stdout(piped_or_null(self.stdout.is_some()));
        cmd.stderr(piped_or_null(self.stderr.is_some()));
    }

    /// Take the spawned child's pipes and start one copy loop per stream.
    pub fn attach(self, id: &str, child: &mut Child) {
        if let (Some(fifo), Some(stdin)) = (self.stdin, child.stdin.take()) {
            match tokio::process::ChildStdin::from_std(stdin) {
                Ok(stdin) => {
                    tokio::spawn(copy_loop(id.to_string(), "stdin", fifo, stdin));
                }
                Err(e) => error!("Task {id}: failed to register stdin pipe: {e}"),
            }
        }

        if let (Some(fifo), Some(stdout)) = (self.stdout, child.stdout.take()) {
            match tokio::process::ChildStdout::from_std(stdout) {
                Ok(stdout) => {
                    tokio::spawn(copy_loop(id.to_string(), "stdout", stdout, fifo));
                }
                Err(e) => error!("Task {id}: failed to register stdout pipe: {e}"),
            }
        }

        if let (Some(fifo), Some(stderr)) = (self.stderr, child.stderr.take()) {
            match tokio::process::ChildStderr::from_std(stderr) {
                Ok(stderr) => {
                    tokio::spawn(copy_loop(id.to_string(), "stderr", stderr, fifo));
                }
                Err(e) => error!("Task {id}: failed to register stderr pipe: {e}"),
            }
        }
    }
}

fn piped_or_null(wired: bool) -> Stdio {
    if wired { Stdio::piped() } else { Stdio::null() }
}

fn open_if_set<T>(path: &str, open: fn(&Path) -> io::Result<T>) -> io::Result<Option<T>> {
    if path.is_empty() {
        return Ok(None);
    }
    let path = Path::new(path);
    ensure_fifo(path)?;
    open(path).map(Some)
}

fn open_reader(path: &Path) -> io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().open_receiver(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("opening read only fifo {}: {e}", path.display()),
        )
    })
}

fn open_writer(path: &Path) -> io::Result<pipe::Sender> {
    pipe::OpenOptions::new().open_sender(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("opening write only fifo {}: {e}", path.display()),
        )
    })
}

async fn copy_loop<R, W>(id: String, stream: &'static str, mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!("Task {id}: {stream} closed after {bytes} bytes"),
        Err(e) => error!("Task {id}: failed to copy {stream}: {e}"),
    }
    let _ = writer.shutdown().await;
}
