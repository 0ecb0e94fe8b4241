//! Listening-socket sharing strategies (§4.1).
//!
//! Two ways exist to hand a listening socket to N worker processes: let the
//! kernel fan out accepts via `SO_REUSEPORT` (each worker binds its own
//! socket), or bind once in the parent and pass the descriptor to whichever
//! worker asks for it. `Transport` picks one at construction and, for the
//! fd-passing case, owns the bind-once cache so a URI is never bound twice.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::Mutex;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Each worker binds its own socket with `SO_REUSEPORT`; the parent never
  /// holds a listener.
  ReusePort,
  /// The parent binds once and passes a duplicate descriptor to whichever
  /// worker asks for a given uri.
  FdPassing,
}

impl Strategy {
  /// Best available strategy on this platform. `SO_REUSEPORT` is available
  /// on Linux/BSD/macOS; anywhere else, fall back to fd-passing.
  pub fn detect() -> Self {
    if cfg!(any(
      target_os = "linux",
      target_os = "macos",
      target_os = "freebsd",
      target_os = "dragonfly",
      target_os = "openbsd",
      target_os = "netbsd"
    )) {
      Strategy::ReusePort
    } else {
      Strategy::FdPassing
    }
  }
}

/// A listener bound once by the parent for the fd-passing strategy. Kept
/// alive for as long as the Transport lives so its fd stays valid for
/// workers that connect later.
enum BoundListener {
  Tcp(std::net::TcpListener),
  Unix(StdUnixListener),
}

impl BoundListener {
  fn as_raw_fd(&self) -> RawFd {
    match self {
      BoundListener::Tcp(l) => l.as_raw_fd(),
      BoundListener::Unix(l) => l.as_raw_fd(),
    }
  }
}

/// Outcome of `Transport::obtain_listener`, handed back to whichever IPC
/// Channel is servicing the worker's `bind_request`.
pub enum ObtainedListener {
  /// The worker should bind this uri itself with port reuse.
  PortReuse,
  /// A duplicate of this fd should be sent to the worker. The Transport
  /// retains ownership of the original; `sendmsg`'s `SCM_RIGHTS` duplicates
  /// the descriptor into the receiving process without consuming ours, so
  /// no explicit `dup` is needed here (§9 "FD ownership on transfer").
  Fd(RawFd),
}

pub struct Transport {
  strategy: Strategy,
  listeners_cache: Mutex<HashMap<String, Arc<BoundListener>>>,
}

impl Transport {
  pub fn new(strategy: Strategy) -> Self {
    Self {
      strategy,
      listeners_cache: Mutex::new(HashMap::new()),
    }
  }

  pub fn strategy(&self) -> Strategy {
    self.strategy
  }

  /// Serve a `bind_request(uri)`. Binds at most once per uri for the
  /// lifetime of this Transport (§3 invariant).
  pub async fn obtain_listener(&self, uri: &str) -> Result<ObtainedListener, TransportError> {
    if self.strategy == Strategy::ReusePort {
      return Ok(ObtainedListener::PortReuse);
    }

    let mut cache = self.listeners_cache.lock().await;
    if let Some(existing) = cache.get(uri) {
      return Ok(ObtainedListener::Fd(existing.as_raw_fd()));
    }

    let bound = bind_uri(uri)?;
    let fd = bound.as_raw_fd();
    cache.insert(uri.to_string(), Arc::new(bound));
    Ok(ObtainedListener::Fd(fd))
  }
}

fn bind_uri(uri: &str) -> Result<BoundListener, TransportError> {
  if let Some(rest) = uri.strip_prefix("tcp://") {
    return bind_tcp(uri, rest);
  }
  if let Some(rest) = uri.strip_prefix("unix://") {
    return bind_unix(uri, rest);
  }
  Err(TransportError::UnsupportedUri(uri.to_string()))
}

fn bind_tcp(uri: &str, host_port: &str) -> Result<BoundListener, TransportError> {
  let addr: SocketAddr = host_port
    .parse()
    .map_err(|e| TransportError::BindFailed {
      uri: uri.to_string(),
      message: format!("invalid tcp address {host_port}: {e}"),
    })?;

  let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
  let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
    TransportError::Io {
      uri: uri.to_string(),
      source: e,
    }
  })?;

  socket
    .set_reuse_address(true)
    .map_err(|e| TransportError::Io {
      uri: uri.to_string(),
      source: e,
    })?;
  if addr.is_ipv6() {
    let _ = socket.set_only_v6(true);
  }

  socket
    .bind(&addr.into())
    .map_err(|e| TransportError::BindFailed {
      uri: uri.to_string(),
      message: e.to_string(),
    })?;
  socket.listen(1024).map_err(|e| TransportError::BindFailed {
    uri: uri.to_string(),
    message: e.to_string(),
  })?;
  socket.set_nonblocking(true).map_err(|e| TransportError::Io {
    uri: uri.to_string(),
    source: e,
  })?;

  Ok(BoundListener::Tcp(socket.into()))
}

fn bind_unix(uri: &str, path: &str) -> Result<BoundListener, TransportError> {
  let path = Path::new(path);
  if path.exists() {
    std::fs::remove_file(path).map_err(|e| TransportError::Io {
      uri: uri.to_string(),
      source: e,
    })?;
  }

  let listener = StdUnixListener::bind(path).map_err(|e| TransportError::BindFailed {
    uri: uri.to_string(),
    message: e.to_string(),
  })?;
  listener
    .set_nonblocking(true)
    .map_err(|e| TransportError::Io {
      uri: uri.to_string(),
      source: e,
    })?;

  Ok(BoundListener::Unix(listener))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn reuse_port_strategy_never_binds() {
    let transport = Transport::new(Strategy::ReusePort);
    let outcome = transport.obtain_listener("tcp://127.0.0.1:0").await.unwrap();
    assert!(matches!(outcome, ObtainedListener::PortReuse));
  }

  #[tokio::test]
  async fn fd_passing_binds_a_uri_exactly_once() {
    let transport = Transport::new(Strategy::FdPassing);
    let first = transport.obtain_listener("tcp://127.0.0.1:0").await.unwrap();
    let second = transport.obtain_listener("tcp://127.0.0.1:0").await.unwrap();
    let (ObtainedListener::Fd(a), ObtainedListener::Fd(b)) = (first, second) else {
      panic!("expected fd-passing outcomes");
    };
    assert_eq!(a, b);
  }

  #[tokio::test]
  async fn unsupported_uri_scheme_is_rejected() {
    let transport = Transport::new(Strategy::FdPassing);
    let err = transport.obtain_listener("carrier-pigeon://nowhere").await.unwrap_err();
    assert!(matches!(err, TransportError::UnsupportedUri(_)));
  }
}
