//! mvirt-shim - per-container task shim.
//!
//! `start` / `stop` / `info` are the host-facing manager commands, `serve`
//! runs the task API. When the first argument is the launch sentinel the
//! binary is only a stop-then-exec wrapper for a workload.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{error, info};
use mvirt_shim::manager::{self, StartOptions};
use mvirt_shim::services::shutdown::Shutdown;
use mvirt_shim::services::task::TaskService;
use mvirt_shim::utils::launcher::{self, LAUNCH_ARG, Launcher};
use mvirt_shim::{Config, Interpreter, default_state_dir};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code when the launch wrapper cannot exec the workload.
const EXIT_LAUNCH_FAILED: i32 = 127;

/// Per-container task shim.
#[derive(Parser)]
#[command(name = "mvirt-shim")]
#[command(version = VERSION)]
#[command(about = "Per-container task shim")]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Task id
    #[arg(long, global = true, default_value = "")]
    id: String,

    /// Directory holding per-task state (default: parent of the working directory)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Interpreter that runs workload files
    #[arg(long, global = true)]
    interpreter: Option<PathBuf>,

    /// Argument passed to the interpreter before the workload file
    #[arg(long = "interpreter-arg", global = true, allow_hyphen_values = true)]
    interpreter_args: Vec<String>,

    /// Accepted workload file extension (repeatable; default: sh)
    #[arg(long = "extension", global = true)]
    extensions: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a detached shim and print its bootstrap parameters
    Start {
        /// Socket path (default: <state-dir>/<id>/shim.sock)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Kill the task's init process through its pid file
    Stop,
    /// Print runtime information
    Info,
    /// Serve the task API
    Serve {
        /// Socket path to bind, or to remove on exit when --socket-fd is set
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Inherited listening socket
        #[arg(long)]
        socket_fd: Option<RawFd>,
    },
}

impl Args {
    fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    fn interpreter(&self) -> Interpreter {
        let mut interpreter = Interpreter::default();
        if let Some(program) = &self.interpreter {
            interpreter.program = program.clone();
        }
        interpreter.args = self.interpreter_args.clone();
        if !self.extensions.is_empty() {
            interpreter.extensions = self.extensions.clone();
        }
        interpreter
    }

    /// Global flags a started shim must see again.
    fn forwarded(&self) -> Vec<String> {
        let mut args = vec![
            "--state-dir".to_string(),
            self.state_dir().display().to_string(),
        ];
        if let Some(program) = &self.interpreter {
            args.push("--interpreter".to_string());
            args.push(program.display().to_string());
        }
        for arg in &self.interpreter_args {
            args.push(format!("--interpreter-arg={arg}"));
        }
        for ext in &self.extensions {
            args.push(format!("--extension={ext}"));
        }
        args
    }

    fn require_id(&self) -> Result<&str> {
        if self.id.is_empty() {
            bail!("--id is required");
        }
        Ok(&self.id)
    }
}

fn main() -> Result<()> {
    let mut argv = std::env::args_os();
    if argv.nth(1).is_some_and(|arg| arg == LAUNCH_ARG) {
        let err = launcher::exec_suspended(argv.collect());
        eprintln!("mvirt-shim: failed to launch workload: {err}");
        std::process::exit(EXIT_LAUNCH_FAILED);
    }

    let args = Args::parse();

    // Initialize logging
    let default_level = if args.debug { "info,mvirt_shim=debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    match &args.command {
        Command::Start { socket } => {
            let id = args.require_id()?;
            let socket = socket
                .clone()
                .unwrap_or_else(|| manager::socket_path(&args.state_dir(), id));
            let params = manager::start(&StartOptions {
                shim: std::env::current_exe().context("locating shim binary")?,
                id: id.to_string(),
                socket,
                debug: args.debug,
                args: args.forwarded(),
            })?;
            println!("{}", serde_json::to_string(&params)?);
        }
        Command::Stop => {
            let status = manager::stop(&args.state_dir(), args.require_id()?)?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Info => {
            println!("{}", serde_json::to_string(&manager::info())?);
        }
        Command::Serve { socket, socket_fd } => {
            let config = Config {
                state_dir: args.state_dir(),
                launcher: Launcher::current_exe().context("locating shim binary")?,
                interpreter: args.interpreter(),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_serve(config, socket.clone(), *socket_fd))?;
        }
    }

    Ok(())
}

/// Serve the task API until every task has exited or shutdown is requested.
async fn run_serve(config: Config, socket: Option<PathBuf>, socket_fd: Option<RawFd>) -> Result<()> {
    info!("mvirt-shim v{} starting (pid {})", VERSION, std::process::id());

    let listener = match (&socket, socket_fd) {
        (_, Some(fd)) => {
            // SAFETY: the manager hands over a listening socket on this fd and
            // nothing else in this process owns it.
            let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
            let listener = manager::adopt_listener(listener).context("adopting inherited socket")?;
            UnixListener::from_std(listener).context("registering inherited socket")?
        }
        (Some(path), None) => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            UnixListener::bind(path)
                .with_context(|| format!("binding {}", path.display()))?
        }
        (None, None) => bail!("either --socket or --socket-fd is required"),
    };

    let shutdown = Shutdown::new();
    if let Some(path) = socket {
        shutdown.register_callback(move || {
            if let Err(e) = std::fs::remove_file(&path) {
                error!("Failed to remove socket {}: {}", path.display(), e);
            }
        });
    }

    let mut sigint = signal(SignalKind::interrupt()).context("setting up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("setting up SIGTERM handler")?;
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
        on_signal.shutdown();
    });

    let service = Arc::new(TaskService::new(config, shutdown.clone()));
    info!("mvirt-shim ready");

    mvirt_shim::serve(listener, service, shutdown).await?;

    info!("mvirt-shim stopped");
    Ok(())
}
