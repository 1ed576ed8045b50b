//! Rootless, layered Linux container runtime: pulls OCI/Docker images into a chain of
//! overlay layers on disk and launches them in fresh user/mount/pid/ipc/cgroup (and,
//! optionally, net/uts) namespaces.

pub mod config;
pub mod error;
pub mod launcher;
pub mod layer;
mod mounts;
pub mod notify;
pub mod puller;
mod syscall;
pub mod tar;
mod tty;
mod userns;

pub use error::{Error, Result};
pub use layer::Layer;
