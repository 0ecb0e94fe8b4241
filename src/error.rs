//! Error types for each component, matching the behavior-based taxonomy of
//! the supervision design: transport, IPC, and supervisor failures are kept
//! distinct so callers can tell a fatal bind failure from an ordinary
//! worker-exit-triggered channel close.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while binding or otherwise preparing a listener.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("bind failed for {uri}: {message}")]
  BindFailed { uri: String, message: String },

  #[error("unsupported listener uri: {0}")]
  UnsupportedUri(String),

  #[error("io error preparing listener for {uri}: {source}")]
  Io {
    uri: String,
    #[source]
    source: std::io::Error,
  },
}

/// Failures raised by the length-framed IPC channel.
#[derive(Debug, Error)]
pub enum IpcError {
  #[error("channel closed")]
  ChannelClosed,

  #[error("peer gone: {0}")]
  PeerGone(String),

  #[error("malformed frame: {0}")]
  MalformedFrame(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("encode error: {0}")]
  Encode(#[from] bincode::error::EncodeError),

  #[error("decode error: {0}")]
  Decode(#[from] bincode::error::DecodeError),

  #[error("fd passing error: {0}")]
  FdPassing(#[from] nix::errno::Errno),
}

impl IpcError {
  /// True for errors that, during steady-state operation, should be treated
  /// as an ordinary worker exit rather than a structural protocol failure.
  pub fn is_peer_termination(&self) -> bool {
    matches!(
      self,
      IpcError::ChannelClosed
        | IpcError::PeerGone(_)
        | IpcError::Io(_)
    )
  }
}

/// Top-level supervisor error.
#[derive(Debug, Error)]
pub enum SupervisorError {
  #[error("worker start failed: {0}")]
  WorkerStartFailed(String),

  #[error("timeout waiting on worker {pid:?} after {context}")]
  Timeout { pid: Option<u32>, context: String },

  #[error("respawn failed: {0}")]
  RespawnFailed(String),

  #[error("stop failed: {0}")]
  StopFailed(String),

  #[error("misuse: {0}")]
  MisuseError(String),

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error(transparent)]
  Ipc(#[from] IpcError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Configuration validation errors, raised synchronously before any I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("worker_count must be at least 1")]
  ZeroWorkers,

  #[error("worker_command must not be empty")]
  EmptyCommand,

  #[error("cannot construct a Supervisor from inside a worker process")]
  CalledFromWorker,

  #[error("ipc socket path has no parent directory: {0}")]
  InvalidSocketPath(PathBuf),
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
