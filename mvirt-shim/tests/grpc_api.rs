//! Task API tests over a Unix socket.
//!
//! Run with: cargo test -p mvirt-shim --test grpc_api

mod common;

use common::{TestBundle, connect, service, within};
use mvirt_shim::proto::task_client::TaskClient;
use mvirt_shim::proto::*;
use mvirt_shim::services::shutdown::Shutdown;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tonic::{Code, Request};

struct Server {
    client: TaskClient<Channel>,
    shutdown: Shutdown,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

async fn serve(bundle: &TestBundle) -> Server {
    let socket: PathBuf = bundle.root().join("shim.sock");
    let listener = UnixListener::bind(&socket).expect("Failed to bind socket");
    let (service, shutdown) = service(bundle);

    let handle = tokio::spawn(mvirt_shim::serve(listener, service, shutdown.clone()));
    let client = connect(&socket).await;

    Server {
        client,
        shutdown,
        handle,
    }
}

fn create_request(bundle: &TestBundle, id: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        id: id.to_string(),
        bundle: bundle.path().display().to_string(),
        ..Default::default()
    }
}

/// Test: Create, inspect, start and kill a task; the server then stops.
#[tokio::test]
async fn test_task_over_grpc() {
    let bundle = TestBundle::new("sleep 30\n");
    let mut server = serve(&bundle).await;
    let client = &mut server.client;

    let pid = client
        .create(create_request(&bundle, "t1"))
        .await
        .expect("Create failed")
        .into_inner()
        .pid;
    assert!(pid > 0);

    let state = client
        .state(StateRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .expect("State failed")
        .into_inner();
    assert_eq!(state.id, "t1");
    assert_eq!(state.pid, pid);
    assert_eq!(state.status(), TaskStatus::Running);
    assert_eq!(state.bundle, bundle.path().display().to_string());
    assert!(!state.terminal);
    assert_eq!(state.exit_status, 0);
    assert!(state.exited_at.is_none());

    let connected = client
        .connect(ConnectRequest { id: "t1".into() })
        .await
        .expect("Connect failed")
        .into_inner();
    assert_eq!(connected.shim_pid, std::process::id());
    assert_eq!(connected.task_pid, pid);
    assert_eq!(connected.version, env!("CARGO_PKG_VERSION"));

    let started = client
        .start(StartRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .expect("Start failed")
        .into_inner();
    assert_eq!(started.pid, pid);

    let err = client
        .delete(DeleteRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    // Kill blocks until the task is gone; the server winds down right after.
    within(client.kill(KillRequest {
        id: "t1".into(),
        signal: 9,
        ..Default::default()
    }))
    .await
    .expect("Kill failed");

    within(server.shutdown.wait()).await;
    within(server.handle)
        .await
        .expect("Server task panicked")
        .expect("Server failed");
}

/// Test: Wait with a deadline is cancelled while the task keeps running.
#[tokio::test]
async fn test_wait_deadline() {
    let bundle = TestBundle::new("sleep 30\n");
    let mut server = serve(&bundle).await;
    let client = &mut server.client;
    client.create(create_request(&bundle, "t1")).await.unwrap();

    let mut request = Request::new(WaitRequest {
        id: "t1".into(),
        ..Default::default()
    });
    request.set_timeout(Duration::from_millis(200));
    let err = within(client.wait(request)).await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);

    let state = client
        .state(StateRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(state.status(), TaskStatus::Running);

    client
        .kill(KillRequest {
            id: "t1".into(),
            signal: 9,
            ..Default::default()
        })
        .await
        .unwrap();
}

/// Test: An exited task reports its status until deleted.
#[tokio::test]
async fn test_wait_and_delete() {
    let bundle = TestBundle::new("exit 4\n");
    let mut server = serve(&bundle).await;
    let client = &mut server.client;

    // Keep the shim alive past the first task's exit.
    client.create(create_request(&bundle, "keep")).await.unwrap();
    let pid = client
        .create(create_request(&bundle, "t1"))
        .await
        .unwrap()
        .into_inner()
        .pid;
    client
        .start(StartRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let waited = within(client.wait(WaitRequest {
        id: "t1".into(),
        ..Default::default()
    }))
    .await
    .expect("Wait failed")
    .into_inner();
    assert_eq!(waited.exit_status, 4);
    assert!(waited.exited_at.is_some());

    let state = client
        .state(StateRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(state.status(), TaskStatus::Stopped);
    assert_eq!(state.exit_status, 4);
    assert_eq!(state.exited_at, waited.exited_at);

    let deleted = client
        .delete(DeleteRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(deleted.pid, pid);
    assert_eq!(deleted.exit_status, 4);
    assert_eq!(deleted.exited_at, waited.exited_at);

    let err = client
        .state(StateRequest {
            id: "t1".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    client
        .kill(KillRequest {
            id: "keep".into(),
            signal: 9,
            ..Default::default()
        })
        .await
        .unwrap();
}

/// Test: Rejected creates map to their status codes.
#[tokio::test]
async fn test_create_errors() {
    let bundle = TestBundle::new("sleep 30\n");
    let mut server = serve(&bundle).await;
    let client = &mut server.client;

    let mut terminal = create_request(&bundle, "t1");
    terminal.terminal = true;
    let err = client.create(terminal).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let mut missing = create_request(&bundle, "t1");
    missing.bundle = bundle.root().join("nope").display().to_string();
    let err = client.create(missing).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    client.create(create_request(&bundle, "t1")).await.unwrap();
    let err = client
        .create(create_request(&bundle, "t1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    client
        .kill(KillRequest {
            id: "t1".into(),
            signal: 9,
            ..Default::default()
        })
        .await
        .unwrap();
}

/// Test: Unsupported verbs answer with fixed codes.
#[tokio::test]
async fn test_unsupported_verbs() {
    let bundle = TestBundle::new("sleep 30\n");
    let mut server = serve(&bundle).await;
    let client = &mut server.client;
    let id = || "t1".to_string();

    let codes = [
        client
            .pids(PidsRequest { id: id() })
            .await
            .map(drop)
            .unwrap_err()
            .code(),
        client
            .pause(PauseRequest { id: id() })
            .await
            .map(drop)
            .unwrap_err()
            .code(),
        client
            .resume(ResumeRequest { id: id() })
            .await
            .map(drop)
            .unwrap_err()
            .code(),
        client
            .checkpoint(CheckpointTaskRequest {
                id: id(),
                path: "/tmp/cp".into(),
            })
            .await
            .map(drop)
            .unwrap_err()
            .code(),
        client
            .exec(ExecProcessRequest {
                id: id(),
                exec_id: "e1".into(),
                ..Default::default()
            })
            .await
            .map(drop)
            .unwrap_err()
            .code(),
        client
            .close_io(CloseIoRequest {
                id: id(),
                ..Default::default()
            })
            .await
            .map(drop)
            .unwrap_err()
            .code(),
    ];
    assert!(codes.iter().all(|code| *code == Code::Unimplemented), "{codes:?}");

    let err = client.update(UpdateTaskRequest { id: id() }).await.unwrap_err();
    assert_eq!(err.code(), Code::Aborted);

    client
        .resize_pty(ResizePtyRequest {
            id: id(),
            width: 80,
            height: 24,
            ..Default::default()
        })
        .await
        .expect("ResizePty failed");

    let stats = client
        .stats(StatsRequest { id: id() })
        .await
        .expect("Stats failed")
        .into_inner();
    assert!(stats.stats.is_some());
}

/// Test: A non-empty exec id names an unknown process.
#[tokio::test]
async fn test_exec_id_not_found() {
    let bundle = TestBundle::new("sleep 30\n");
    let mut server = serve(&bundle).await;
    let client = &mut server.client;
    client.create(create_request(&bundle, "t1")).await.unwrap();

    let err = client
        .state(StateRequest {
            id: "t1".into(),
            exec_id: "e1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = client
        .kill(KillRequest {
            id: "t1".into(),
            exec_id: "e1".into(),
            signal: 9,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    client
        .kill(KillRequest {
            id: "t1".into(),
            signal: 9,
            ..Default::default()
        })
        .await
        .unwrap();
}

/// Test: Shutdown stops the server even with no tasks.
#[tokio::test]
async fn test_shutdown_request() {
    let bundle = TestBundle::new("exit 0\n");
    let mut server = serve(&bundle).await;

    server
        .client
        .shutdown(ShutdownRequest {
            id: "t1".into(),
            now: false,
        })
        .await
        .expect("Shutdown failed");

    assert!(server.shutdown.is_shutdown());
    within(server.handle)
        .await
        .expect("Server task panicked")
        .expect("Server failed");
}
