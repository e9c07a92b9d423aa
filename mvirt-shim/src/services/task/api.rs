//! Task API Handler - gRPC implementation of the task protocol.

use super::{CreateTask, ExitInfo, TaskService};
use crate::error::Error;
use crate::proto::{
    Any, CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse,
    CreateTaskRequest, CreateTaskResponse, DeleteRequest, DeleteResponse, Empty,
    ExecProcessRequest, KillRequest, PauseRequest, PidsRequest, PidsResponse, ResizePtyRequest,
    ResumeRequest, ShutdownRequest, StartRequest, StartResponse, StateRequest, StateResponse,
    StatsRequest, StatsResponse, TaskStatus, Timestamp, UpdateTaskRequest, WaitRequest,
    WaitResponse, task_server::Task,
};
use crate::utils::fifo::StdioPaths;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::{Request, Response, Status};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Task API Handler for gRPC requests.
#[derive(Debug, Clone)]
pub struct TaskApiHandler {
    service: Arc<TaskService>,
}

impl TaskApiHandler {
    pub fn new(service: Arc<TaskService>) -> Self {
        Self { service }
    }
}

/// Exec processes are never created, so any exec id is unknown.
fn check_exec_id(id: &str, exec_id: &str) -> Result<(), Status> {
    if exec_id.is_empty() {
        Ok(())
    } else {
        Err(Error::NotFound(format!("{id} exec {exec_id}")).into())
    }
}

fn timestamp(at: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn exit_fields(exit: Option<ExitInfo>) -> (u32, Option<Timestamp>) {
    match exit {
        Some(exit) => (exit.status, Some(timestamp(exit.exited_at))),
        None => (0, None),
    }
}

#[tonic::async_trait]
impl Task for TaskApiHandler {
    async fn state(&self, request: Request<StateRequest>) -> Result<Response<StateResponse>, Status> {
        let req = request.into_inner();
        debug!("API: State id={}", req.id);
        check_exec_id(&req.id, &req.exec_id)?;

        let task = self.service.state(&req.id)?;
        let status = if task.is_running() {
            TaskStatus::Running
        } else {
            TaskStatus::Stopped
        };
        let (exit_status, exited_at) = exit_fields(task.exit);

        Ok(Response::new(StateResponse {
            id: task.id,
            bundle: task.bundle,
            pid: task.pid,
            status: status.into(),
            stdin: task.stdio.stdin,
            stdout: task.stdio.stdout,
            stderr: task.stdio.stderr,
            terminal: false,
            exit_status,
            exited_at,
            exec_id: String::new(),
        }))
    }

    async fn create(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let req = request.into_inner();
        info!("API: Create id={} bundle={}", req.id, req.bundle);

        if req.terminal {
            return Err(Status::invalid_argument("terminal tasks are not supported"));
        }

        let pid = self
            .service
            .create(CreateTask {
                id: req.id,
                bundle: PathBuf::from(req.bundle),
                stdio: StdioPaths {
                    stdin: req.stdin,
                    stdout: req.stdout,
                    stderr: req.stderr,
                },
            })
            .await?;

        Ok(Response::new(CreateTaskResponse { pid }))
    }

    async fn start(&self, request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        info!("API: Start id={}", req.id);
        check_exec_id(&req.id, &req.exec_id)?;

        let pid = self.service.start(&req.id)?;
        Ok(Response::new(StartResponse { pid }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        info!("API: Delete id={}", req.id);
        check_exec_id(&req.id, &req.exec_id)?;

        let (pid, exit) = self.service.delete(&req.id)?;
        Ok(Response::new(DeleteResponse {
            pid,
            exit_status: exit.status,
            exited_at: Some(timestamp(exit.exited_at)),
        }))
    }

    async fn pids(&self, _request: Request<PidsRequest>) -> Result<Response<PidsResponse>, Status> {
        debug!("API: Pids");
        Err(Error::NotImplemented("Pids").into())
    }

    async fn pause(&self, _request: Request<PauseRequest>) -> Result<Response<Empty>, Status> {
        debug!("API: Pause");
        Err(Error::NotImplemented("Pause").into())
    }

    async fn resume(&self, _request: Request<ResumeRequest>) -> Result<Response<Empty>, Status> {
        debug!("API: Resume");
        Err(Error::NotImplemented("Resume").into())
    }

    async fn checkpoint(
        &self,
        _request: Request<CheckpointTaskRequest>,
    ) -> Result<Response<Empty>, Status> {
        debug!("API: Checkpoint");
        Err(Error::NotImplemented("Checkpoint").into())
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!("API: Kill id={} signal={}", req.id, req.signal);
        check_exec_id(&req.id, &req.exec_id)?;

        // tonic enforces `grpc-timeout` and drops this future once it passes.
        self.service.kill(&req.id, req.signal, pending()).await?;
        Ok(Response::new(Empty {}))
    }

    async fn exec(&self, _request: Request<ExecProcessRequest>) -> Result<Response<Empty>, Status> {
        debug!("API: Exec");
        Err(Error::NotImplemented("Exec").into())
    }

    async fn resize_pty(
        &self,
        _request: Request<ResizePtyRequest>,
    ) -> Result<Response<Empty>, Status> {
        debug!("API: ResizePty");
        Ok(Response::new(Empty {}))
    }

    async fn close_io(&self, _request: Request<CloseIoRequest>) -> Result<Response<Empty>, Status> {
        debug!("API: CloseIo");
        Err(Error::NotImplemented("CloseIo").into())
    }

    async fn update(&self, _request: Request<UpdateTaskRequest>) -> Result<Response<Empty>, Status> {
        debug!("API: Update");
        Err(Error::Aborted("Update").into())
    }

    async fn wait(&self, request: Request<WaitRequest>) -> Result<Response<WaitResponse>, Status> {
        let req = request.into_inner();
        debug!("API: Wait id={}", req.id);
        check_exec_id(&req.id, &req.exec_id)?;

        let exit = self.service.wait(&req.id, pending()).await?;
        Ok(Response::new(WaitResponse {
            exit_status: exit.status,
            exited_at: Some(timestamp(exit.exited_at)),
        }))
    }

    async fn stats(&self, request: Request<StatsRequest>) -> Result<Response<StatsResponse>, Status> {
        debug!("API: Stats id={}", request.get_ref().id);
        Ok(Response::new(StatsResponse {
            stats: Some(Any::default()),
        }))
    }

    async fn connect(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectResponse>, Status> {
        let req = request.into_inner();
        debug!("API: Connect id={}", req.id);

        let (shim_pid, task_pid) = self.service.connect(&req.id)?;
        Ok(Response::new(ConnectResponse {
            shim_pid,
            task_pid,
            version: VERSION.to_string(),
        }))
    }

    async fn shutdown(&self, request: Request<ShutdownRequest>) -> Result<Response<Empty>, Status> {
        info!("API: Shutdown id={}", request.get_ref().id);
        self.service.shutdown();
        Ok(Response::new(Empty {}))
    }
}
