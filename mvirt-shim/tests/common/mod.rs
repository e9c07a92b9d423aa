//! Test helpers for mvirt-shim integration tests.

#![allow(dead_code)]

use hyper_util::rt::TokioIo;
use mvirt_shim::proto::task_client::TaskClient;
use mvirt_shim::services::shutdown::Shutdown;
use mvirt_shim::services::task::{CreateTask, TaskService};
use mvirt_shim::utils::fifo::StdioPaths;
use mvirt_shim::utils::launcher::Launcher;
use mvirt_shim::{Config, Interpreter};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A scratch bundle with a single shell workload and a state directory.
pub struct TestBundle {
    dir: TempDir,
}

impl TestBundle {
    /// Bundle whose workload is `script`.
    pub fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(bundle.join("rootfs")).unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();

        std::fs::write(bundle.join("rootfs/main.sh"), script).unwrap();
        let config = serde_json::json!({
            "root": { "path": "rootfs" },
            "process": {
                "args": ["main.sh"],
                "env": ["PATH=/usr/local/bin:/usr/bin:/bin"]
            }
        });
        std::fs::write(
            bundle.join("config.json"),
            serde_json::to_vec(&config).unwrap(),
        )
        .unwrap();

        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("bundle")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// Service configuration launching through the shim binary.
    pub fn config(&self) -> Config {
        Config {
            state_dir: self.state_dir(),
            launcher: Launcher::Reexec(PathBuf::from(env!("CARGO_BIN_EXE_mvirt-shim"))),
            interpreter: Interpreter::default(),
        }
    }

    pub fn create(&self, id: &str) -> CreateTask {
        CreateTask {
            id: id.to_string(),
            bundle: self.path(),
            stdio: StdioPaths::default(),
        }
    }

    /// Make a FIFO next to the bundle.
    pub fn fifo(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).expect("Failed to create fifo");
        path
    }
}

/// A task service over `bundle` with its shutdown coordinator.
pub fn service(bundle: &TestBundle) -> (Arc<TaskService>, Shutdown) {
    let shutdown = Shutdown::new();
    let service = Arc::new(TaskService::new(bundle.config(), shutdown.clone()));
    (service, shutdown)
}

/// Await `future`, failing the test if it takes longer than [`TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("Timed out")
}

/// Connect a task API client over a Unix socket.
pub async fn connect(socket: &Path) -> TaskClient<Channel> {
    let socket = socket.to_path_buf();

    // The URI is ignored, the connector dials the socket.
    let channel = Endpoint::try_from("http://[::]:50051")
        .expect("Invalid endpoint")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move {
                let stream = UnixStream::connect(socket).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .expect("Failed to connect to shim");

    TaskClient::new(channel)
}
