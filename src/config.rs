//! Supervisor configuration: resolving defaults and validating the result
//! before any process is spawned or socket bound.
//!
//! Mirrors the teacher's `config.rs` pattern of a plain struct plus a
//! synchronous `validate` step, but there is no project/global file layer
//! here — the whole configuration surface is the small set of knobs §6
//! exposes on the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::Strategy;

/// Default graceful-stop / worker-start deadline (§3, §5).
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
  /// argv of the worker program; `worker_command[0]` is the executable.
  pub worker_command: Vec<String>,
  /// Number of workers to keep alive.
  pub worker_count: usize,
  /// Deadline for worker start connect-back and graceful stop.
  pub worker_timeout: Duration,
  /// Path to the UNIX-domain IPC server socket.
  pub ipc_socket_path: PathBuf,
  /// Override for the listener-sharing strategy; `None` means autodetect
  /// (§4.1). Exists mainly so tests can force fd-passing on platforms where
  /// port reuse would otherwise be picked.
  pub transport_strategy: Option<Strategy>,
}

impl Config {
  /// Build a config from resolved CLI inputs, choosing a process-unique
  /// socket path under the OS temp directory so that concurrent supervisor
  /// instances never collide (§6a).
  pub fn new(worker_command: Vec<String>, worker_count: usize) -> Self {
    Self {
      worker_command,
      worker_count,
      worker_timeout: DEFAULT_WORKER_TIMEOUT,
      ipc_socket_path: default_socket_path(),
      transport_strategy: None,
    }
  }

  pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
    self.worker_timeout = timeout;
    self
  }

  pub fn with_ipc_socket_path(mut self, path: PathBuf) -> Self {
    self.ipc_socket_path = path;
    self
  }

  pub fn with_transport_strategy(mut self, strategy: Strategy) -> Self {
    self.transport_strategy = Some(strategy);
    self
  }

  /// Validate synchronously, before any I/O (§7a `MisuseError`).
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.worker_count == 0 {
      return Err(ConfigError::ZeroWorkers);
    }
    if self.worker_command.is_empty() || self.worker_command[0].is_empty() {
      return Err(ConfigError::EmptyCommand);
    }
    if self.ipc_socket_path.parent().is_none() {
      return Err(ConfigError::InvalidSocketPath(self.ipc_socket_path.clone()));
    }
    Ok(())
  }
}

/// Default worker count: the CPU-count discovery named out of scope in §1
/// is delegated straight to the standard library's parallelism hint.
pub fn default_worker_count() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}

fn default_socket_path() -> PathBuf {
  let unique = format!("prefork-{}.sock", std::process::id());
  std::env::temp_dir().join(unique)
}

/// Resolve a socket path, honoring an explicit override for tests.
pub fn socket_path_in(dir: &Path) -> PathBuf {
  dir.join(format!("prefork-{}.sock", std::process::id()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_zero_workers() {
    let cfg = Config::new(vec!["true".to_string()], 0);
    assert!(matches!(cfg.validate(), Err(ConfigError::ZeroWorkers)));
  }

  #[test]
  fn rejects_empty_command() {
    let cfg = Config::new(vec![], 2);
    assert!(matches!(cfg.validate(), Err(ConfigError::EmptyCommand)));
  }

  #[test]
  fn accepts_sane_config() {
    let cfg = Config::new(vec!["true".to_string()], 2);
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.worker_timeout, DEFAULT_WORKER_TIMEOUT);
  }

  #[test]
  fn default_worker_count_is_at_least_one() {
    assert!(default_worker_count() >= 1);
  }
}
