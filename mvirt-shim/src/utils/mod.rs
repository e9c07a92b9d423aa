//! Low-level helpers shared by the services.

pub mod exit;
pub mod fifo;
pub mod launcher;
pub mod pidfile;
pub mod signals;
