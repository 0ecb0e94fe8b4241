//! Worker-side runtime (§4.3): the glue a worker's `main` links against to
//! talk back to its Supervisor.
//!
//! `connect` sets a process-wide flag the moment it runs, which is how
//! `Supervisor::new` enforces "cannot construct a Supervisor from inside a
//! worker process" (§9 "process-wide singleton check") even if the worker
//! script also happens to link the supervisor half of this crate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch, Mutex};

use crate::error::IpcError;
use crate::ipc::{BindOutcome, IpcChannel, Message, PeerId};

static IS_WORKER: AtomicBool = AtomicBool::new(false);

/// True once this process has called `connect`.
pub fn is_worker() -> bool {
  IS_WORKER.load(Ordering::SeqCst)
}

type EventHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// A `get_listener` call awaiting its `bind_response`, parked here so the
/// single background `recv_loop` can resolve it in place (§4.2 "receive
/// contract: single consumer" — `get_listener` must not read the channel
/// itself in parallel with the loop).
type PendingBind = (String, oneshot::Sender<Result<ObtainedListener, IpcError>>);

/// The worker side of one IPC Channel, plus the dispatch table for
/// `on_message`/`send` and the shutdown-wait primitive.
pub struct WorkerRuntime {
  ipc: Arc<IpcChannel>,
  handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
  shutdown_tx: watch::Sender<bool>,
  shutdown_rx: watch::Receiver<bool>,
  pending_bind: Mutex<Option<PendingBind>>,
}

impl WorkerRuntime {
  /// Connect to the parent's IPC server at `parent_uri` (the worker's first
  /// argv, per §6 "Worker-facing contract"), and start the background
  /// receive loop that dispatches `on_message` handlers.
  pub async fn connect(parent_uri: &Path) -> Result<Arc<Self>, IpcError> {
    IS_WORKER.store(true, Ordering::SeqCst);

    let stream = UnixStream::connect(parent_uri).await?;
    let pid = std::process::id();
    let ipc = Arc::new(IpcChannel::new(stream, PeerId { pid }));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = Arc::new(WorkerRuntime {
      ipc,
      handlers: Mutex::new(HashMap::new()),
      shutdown_tx,
      shutdown_rx,
      pending_bind: Mutex::new(None),
    });

    let loop_runtime = runtime.clone();
    tokio::spawn(async move { loop_runtime.recv_loop().await });

    Ok(runtime)
  }

  /// Signal initialization is complete (§4.2 `ready`).
  pub async fn ready(&self) -> Result<(), IpcError> {
    self.ipc.send(&Message::Ready).await
  }

  /// Request a listener for `uri` and wait until the background receive
  /// loop resolves it (§4.3 `get_listener`). Returns a listener the
  /// application may accept on immediately, regardless of which sharing
  /// strategy the Transport picked: under port-reuse this binds `uri`
  /// itself with `SO_REUSEPORT` set (§4.1 bullet 1, "the worker runtime can
  /// set it on its own sockets"); under fd-passing it adopts the descriptor
  /// the parent sent. Either way the caller only ever sees an
  /// `ObtainedListener::Fd`.
  ///
  /// Only one `get_listener` call may be in flight at a time — the
  /// underlying channel has a single consumer (`recv_loop`), which is where
  /// the matching `bind_response` (and any fd that rides with it) is
  /// actually read off the wire.
  pub async fn get_listener(&self, uri: &str) -> Result<ObtainedListener, IpcError> {
    let (tx, rx) = oneshot::channel();
    {
      let mut pending = self.pending_bind.lock().await;
      if pending.is_some() {
        return Err(IpcError::MalformedFrame(
          "a bind_request is already in flight on this channel".into(),
        ));
      }
      *pending = Some((uri.to_string(), tx));
    }

    if let Err(e) = self
      .ipc
      .send(&Message::BindRequest {
        uri: uri.to_string(),
      })
      .await
    {
      self.pending_bind.lock().await.take();
      return Err(e);
    }

    rx.await.unwrap_or(Err(IpcError::ChannelClosed))
  }

  /// Subscribe to a named application event (§4.3 `on_message`).
  pub async fn on_message<F>(&self, name: &str, handler: F)
  where
    F: Fn(serde_json::Value) + Send + Sync + 'static,
  {
    self
      .handlers
      .lock()
      .await
      .entry(name.to_string())
      .or_default()
      .push(Arc::new(handler));
  }

  /// Emit a named application event to the parent (§4.3 `send`).
  pub async fn send(&self, name: &str, payload: serde_json::Value) -> Result<(), IpcError> {
    self
      .ipc
      .send(&Message::Event {
        name: name.to_string(),
        payload,
      })
      .await
  }

  /// Wait until the parent sends `shutdown` (§4.3 `await_shutdown`). The
  /// caller is expected to drain and exit within `worker_timeout`.
  pub async fn await_shutdown(&self) {
    let mut rx = self.shutdown_rx.clone();
    let _ = rx.wait_for(|v| *v).await;
  }

  /// Acknowledge shutdown and let the parent know it may reap this process.
  pub async fn terminated(&self) -> Result<(), IpcError> {
    self.ipc.send(&Message::Terminated).await
  }

  async fn recv_loop(self: Arc<Self>) {
    loop {
      match self.ipc.recv().await {
        Ok(Message::Shutdown) => {
          let _ = self.shutdown_tx.send(true);
        }
        Ok(Message::Event { name, payload }) => {
          let handlers = self.handlers.lock().await;
          if let Some(hs) = handlers.get(&name) {
            for h in hs {
              h(payload.clone());
            }
          }
        }
        Ok(Message::BindResponse {
          uri: response_uri,
          outcome,
        }) => {
          self.resolve_bind_response(response_uri, outcome).await;
        }
        Ok(_) => {
          // BindRequest/Ready/Terminated are sent by this side, never
          // received; nothing to react to if the parent echoes one back.
        }
        Err(e) if e.is_peer_termination() => break,
        Err(e) => {
          log::error!("worker: ipc error in receive loop: {e}");
          break;
        }
      }
    }
  }

  /// Resolve the `get_listener` call waiting on `response_uri`, consuming
  /// the fd that immediately follows a `FdPassed` outcome on the wire since
  /// this loop is the channel's sole reader (§4.2).
  async fn resolve_bind_response(&self, response_uri: String, outcome: BindOutcome) {
    let pending = self.pending_bind.lock().await.take();
    let Some((expected_uri, tx)) = pending else {
      log::warn!("worker: unexpected bind_response({response_uri}) with no pending bind_request");
      return;
    };
    if expected_uri != response_uri {
      log::warn!(
        "worker: bind_response for {response_uri} but awaiting {expected_uri}, dropping"
      );
      let _ = tx.send(Err(IpcError::MalformedFrame(format!(
        "bind_response uri mismatch: expected {expected_uri}, got {response_uri}"
      ))));
      return;
    }

    let result = match outcome {
      BindOutcome::PortReuse => bind_reuse_port(&response_uri).map(ObtainedListener::Fd),
      BindOutcome::FdPassed => match self.ipc.recv_fd().await {
        Ok(fd) => Ok(ObtainedListener::Fd(fd)),
        Err(e) => Err(e),
      },
      BindOutcome::Failed { message } => Err(IpcError::MalformedFrame(format!(
        "bind_request({response_uri}) failed: {message}"
      ))),
    };
    let _ = tx.send(result);
  }
}

/// A listener obtained via `get_listener`, always backed by a real listening
/// descriptor regardless of which sharing strategy produced it (§4.3).
pub enum ObtainedListener {
  Fd(OwnedFd),
}

impl ObtainedListener {
  /// Convert into a `tokio::net::TcpListener`. The caller must know from its
  /// own uri scheme that this is the right conversion.
  pub fn into_tcp_listener(self) -> std::io::Result<tokio::net::TcpListener> {
    let ObtainedListener::Fd(fd) = self;
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd.into_raw_fd()) };
    std_listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(std_listener)
  }

  pub fn into_unix_listener(self) -> std::io::Result<tokio::net::UnixListener> {
    let ObtainedListener::Fd(fd) = self;
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd.into_raw_fd()) };
    std_listener.set_nonblocking(true)?;
    tokio::net::UnixListener::from_std(std_listener)
  }
}

/// Bind `uri` locally with `SO_REUSEPORT` set, for the port-reuse strategy
/// (§4.1 bullet 1). Mirrors `transport::bind_uri`'s scheme handling and bind
/// semantics (stale unix socket removal, `reuse-address`, IPv6-only) but
/// additionally sets `reuse-port`, which the parent-owned fd-passing path
/// never needs since the parent binds each uri exactly once.
fn bind_reuse_port(uri: &str) -> Result<OwnedFd, IpcError> {
  if let Some(rest) = uri.strip_prefix("tcp://") {
    let addr: SocketAddr = rest
      .parse()
      .map_err(|e| IpcError::MalformedFrame(format!("invalid tcp uri {uri}: {e}")))?;
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let _ = socket.set_reuse_port(true);
    if addr.is_ipv6() {
      let _ = socket.set_only_v6(true);
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    return Ok(unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) });
  }
  if let Some(path) = uri.strip_prefix("unix://") {
    let path = Path::new(path);
    if path.exists() {
      std::fs::remove_file(path)?;
    }
    let listener = StdUnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    return Ok(unsafe { OwnedFd::from_raw_fd(listener.into_raw_fd()) });
  }
  Err(IpcError::MalformedFrame(format!(
    "unsupported listener uri: {uri}"
  )))
}
