//! Error types for the shim.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tonic::Status;

/// Main error type for task operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A task with this id is already registered.
    #[error("task {0} already exists")]
    AlreadyExists(String),

    /// No task with this id is registered.
    #[error("task {0} not found")]
    NotFound(String),

    /// The task is not in a state that allows the operation.
    #[error("{0}")]
    FailedPrecondition(String),

    /// The verb is not supported by this shim.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// The request was rejected.
    #[error("{0} aborted")]
    Aborted(&'static str),

    /// The request itself is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller gave up while the operation was blocked.
    #[error("operation cancelled")]
    Cancelled,

    /// The bundle could not be turned into a runnable workload.
    #[error("invalid bundle: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::errno::Errno),
}

/// Bundle `config.json` validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} not found", .0.display())]
    NotFound(PathBuf),

    #[error("reading {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("root path not found in config file")]
    MissingRoot,

    #[error("incorrect number of args in the process, expected 1, got {0}")]
    ArgCount(usize),

    #[error("entry point {0} does not have a supported extension")]
    Extension(String),

    #[error("workload {} does not exist", .0.display())]
    MissingEntrypoint(PathBuf),
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            Error::AlreadyExists(_) => Status::already_exists(e.to_string()),
            Error::NotFound(_) => Status::not_found(e.to_string()),
            Error::FailedPrecondition(_) => Status::failed_precondition(e.to_string()),
            Error::NotImplemented(_) => Status::unimplemented(e.to_string()),
            Error::Aborted(_) => Status::aborted(e.to_string()),
            Error::Cancelled => Status::cancelled(e.to_string()),
            Error::InvalidArgument(_) | Error::Config(_) => Status::invalid_argument(e.to_string()),
            Error::Io(_) | Error::Nix(_) => Status::internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
