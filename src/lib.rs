//! Pre-forking cluster supervisor.
//!
//! A `Supervisor` spawns worker subprocesses that serve traffic on shared
//! listening sockets handed out either via kernel port reuse or via
//! file-descriptor passing, and supervises their lifetimes: automatic
//! respawn on unexpected exit, rolling restart, graceful stop escalating to
//! kill, and application-level broadcast over a length-framed IPC channel.
//!
//! Two halves link against this crate: the launcher binary (`main.rs`)
//! constructs and drives a [`Supervisor`], while a worker's own `main`
//! links the [`worker`] module to connect back, request listeners, and
//! respond to shutdown.

pub mod cli;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod signals;
pub mod supervisor;
pub mod transport;
pub mod worker;
pub mod worker_handle;

pub use config::Config;
pub use error::{ConfigError, IpcError, SupervisorError, TransportError};
pub use supervisor::Supervisor;
