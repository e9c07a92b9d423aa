//! Service modules for the shim.
//!
//! - The task service owns the task registry and the supervisor
//! - The API handler translates gRPC calls into task service calls
//! - The shutdown coordinator is shared by the service and the server

pub mod shutdown;
pub mod task;
