//! Parent-side representation of one live worker (§4.4).
//!
//! A `WorkerHandle` is the thin, shareable face the Supervisor keeps in its
//! worker set: identity, the IPC channel, and the current lifecycle state.
//! The actual driving work — stdout/stderr pumps, the IPC receive loop, and
//! waiting on the child process — runs inside a single task spawned by
//! `spawn` and reported back to the Supervisor by a `SupervisorCommand`
//! rather than by holding a reference to the Supervisor itself (§9 "weak
//! back-reference from worker exit hook").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{IpcError, SupervisorError};
use crate::ipc::{BindOutcome, IpcChannel, Message};
use crate::supervisor::{SupervisorCommand, WorkerEvent};
use crate::transport::{ObtainedListener, Transport};

type EventHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Starting,
  Ready,
  Stopping,
  Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExitOutcome {
  /// Process exited with status 0 after a `terminated` ack, or after a
  /// requested shutdown.
  Clean,
  /// Process exited with a nonzero status, or the IPC channel broke before
  /// a clean handshake completed.
  Errored,
  /// The Supervisor killed the process (timeout or escalation).
  Killed,
}

pub struct WorkerExit {
  pub worker_id: u64,
  pub pid: u32,
  pub outcome: WorkerExitOutcome,
}

/// Shared handle to one worker, held by both the Supervisor and the task
/// that drives it. Matches §4.4's data model directly: `send`,
/// `request_shutdown`, `run` (resolves when the worker exits), and
/// `on_event` observers local to this one worker.
pub struct WorkerHandle {
  pub worker_id: u64,
  pub pid: u32,
  pub index: usize,
  ipc: Arc<IpcChannel>,
  state: Arc<Mutex<WorkerState>>,
  killed: Arc<AtomicBool>,
  subscribers: Mutex<HashMap<String, Vec<EventHandler>>>,
  exited_rx: watch::Receiver<bool>,
}

impl WorkerHandle {
  pub fn state_handle(&self) -> Arc<Mutex<WorkerState>> {
    self.state.clone()
  }

  pub async fn state(&self) -> WorkerState {
    *self.state.lock().await
  }

  /// Send an application event to this worker (§4.3 `send`).
  pub async fn send(&self, name: &str, payload: serde_json::Value) -> Result<(), IpcError> {
    self
      .ipc
      .send(&Message::Event {
        name: name.to_string(),
        payload,
      })
      .await
  }

  /// Request a graceful stop; the worker is expected to exit within
  /// `worker_timeout` of receiving this (§4.5 Stop).
  pub async fn request_shutdown(&self) -> Result<(), IpcError> {
    *self.state.lock().await = WorkerState::Stopping;
    self.ipc.send(&Message::Shutdown).await
  }

  /// Forcibly terminate the process by pid (escalation on timeout, §4.5
  /// Stop/Start). Marks the pending exit as `Killed` rather than `Errored`.
  pub fn kill(&self) -> Result<(), SupervisorError> {
    self.killed.store(true, Ordering::SeqCst);
    signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL)
      .map_err(|e| SupervisorError::StopFailed(format!("kill(pid={}) failed: {e}", self.pid)))
  }

  /// Resolve once this worker has exited and been fully reaped (§4.4 `run`).
  pub async fn run(&self) {
    let mut rx = self.exited_rx.clone();
    let _ = rx.wait_for(|exited| *exited).await;
  }

  /// Subscribe to a named application event from this one worker (§4.4
  /// `on_event`), as distinct from `Supervisor::on_event`'s pool-wide
  /// fan-out across every worker.
  pub async fn on_event<F>(&self, name: &str, handler: F)
  where
    F: Fn(serde_json::Value) + Send + Sync + 'static,
  {
    self
      .subscribers
      .lock()
      .await
      .entry(name.to_string())
      .or_default()
      .push(Arc::new(handler));
  }

  async fn dispatch_event(&self, name: &str, payload: &serde_json::Value) {
    let subscribers = self.subscribers.lock().await;
    if let Some(handlers) = subscribers.get(name) {
      for handler in handlers {
        handler(payload.clone());
      }
    }
  }
}

/// Everything needed to drive one worker once its process and IPC
/// connect-back both exist, minted by the Supervisor for each slot in the
/// pool.
pub struct WorkerSpawnContext {
  pub worker_id: u64,
  pub index: usize,
  pub transport: Arc<Transport>,
  pub cmd_tx: mpsc::Sender<SupervisorCommand>,
}

/// Wire up a spawned child and its accepted IPC connection into a running
/// `WorkerHandle`. The returned handle's `run()` resolves once the driving
/// task below has reaped the process and torn down its pumps and receive
/// loop; the task itself runs detached, reporting back to the Supervisor
/// purely through `ctx.cmd_tx`.
///
/// The Supervisor is responsible for launching the process and racing the
/// IPC accept against `worker_timeout` (§4.5 step 2); by the time this is
/// called both have already succeeded.
pub async fn spawn(
  ctx: WorkerSpawnContext,
  mut child: Child,
  accepted: tokio::net::UnixStream,
  peer_pid: u32,
) -> Result<Arc<WorkerHandle>, SupervisorError> {
  let pid = child.id().unwrap_or(peer_pid);
  let stdout = child.stdout.take();
  let stderr = child.stderr.take();

  let ipc = Arc::new(IpcChannel::new(
    accepted,
    crate::ipc::PeerId { pid: peer_pid },
  ));
  let state = Arc::new(Mutex::new(WorkerState::Starting));
  let killed = Arc::new(AtomicBool::new(false));
  let (exited_tx, exited_rx) = watch::channel(false);

  let handle = Arc::new(WorkerHandle {
    worker_id: ctx.worker_id,
    pid,
    index: ctx.index,
    ipc,
    state,
    killed,
    subscribers: Mutex::new(HashMap::new()),
    exited_rx,
  });

  let stdout_pump = stdout.map(|s| tokio::spawn(pump_stdout(ctx.index, pid, s)));
  let stderr_pump = stderr.map(|s| tokio::spawn(pump_stderr(ctx.index, pid, s)));

  tokio::spawn(drive_worker(
    handle.clone(),
    child,
    stdout_pump,
    stderr_pump,
    ctx.transport,
    ctx.cmd_tx,
    exited_tx,
  ));

  Ok(handle)
}

async fn drive_worker(
  handle: Arc<WorkerHandle>,
  mut child: Child,
  stdout_pump: Option<tokio::task::JoinHandle<()>>,
  stderr_pump: Option<tokio::task::JoinHandle<()>>,
  transport: Arc<Transport>,
  cmd_tx: mpsc::Sender<SupervisorCommand>,
  exited_tx: watch::Sender<bool>,
) {
  let recv_loop = tokio::spawn(recv_loop(handle.clone(), transport, cmd_tx.clone()));

  let wait_result = child.wait().await;
  recv_loop.abort();
  if let Some(h) = stdout_pump {
    h.abort();
  }
  if let Some(h) = stderr_pump {
    h.abort();
  }

  let outcome = if handle.killed.load(Ordering::SeqCst) {
    WorkerExitOutcome::Killed
  } else {
    match wait_result {
      Ok(status) if status.success() => WorkerExitOutcome::Clean,
      Ok(_) => WorkerExitOutcome::Errored,
      Err(e) => {
        log::error!(
          "worker[{}] pid={}: failed to wait on child: {e}",
          handle.index,
          handle.pid
        );
        WorkerExitOutcome::Errored
      }
    }
  };

  *handle.state.lock().await = WorkerState::Exited;
  log::info!(
    "worker[{}] pid={}: exited ({outcome:?})",
    handle.index,
    handle.pid
  );
  let _ = exited_tx.send(true);

  let _ = cmd_tx
    .send(SupervisorCommand::WorkerExited(WorkerExit {
      worker_id: handle.worker_id,
      pid: handle.pid,
      outcome,
    }))
    .await;
}

impl std::fmt::Debug for WorkerExitOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      WorkerExitOutcome::Clean => "clean",
      WorkerExitOutcome::Errored => "errored",
      WorkerExitOutcome::Killed => "killed",
    };
    f.write_str(label)
  }
}

async fn pump_stdout(index: usize, pid: u32, stdout: tokio::process::ChildStdout) {
  let mut lines = BufReader::new(stdout).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => log::info!("worker[{index}] pid={pid}: {line}"),
      Ok(None) => break,
      Err(e) => {
        log::warn!("worker[{index}] pid={pid}: stdout pump error: {e}");
        break;
      }
    }
  }
}

async fn pump_stderr(index: usize, pid: u32, stderr: tokio::process::ChildStderr) {
  let mut lines = BufReader::new(stderr).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => log::error!("worker[{index}] pid={pid}: {line}"),
      Ok(None) => break,
      Err(e) => {
        log::warn!("worker[{index}] pid={pid}: stderr pump error: {e}");
        break;
      }
    }
  }
}

async fn recv_loop(
  handle: Arc<WorkerHandle>,
  transport: Arc<Transport>,
  cmd_tx: mpsc::Sender<SupervisorCommand>,
) {
  let pid = handle.pid;
  loop {
    match handle.ipc.recv().await {
      Ok(Message::BindRequest { uri }) => {
        if let Err(e) = handle_bind_request(&handle.ipc, &transport, &uri).await {
          log::error!("worker pid={pid}: bind_request({uri}) failed: {e}");
        }
      }
      Ok(Message::Ready) => {
        *handle.state.lock().await = WorkerState::Ready;
        log::info!("worker pid={pid}: ready");
        let _ = cmd_tx
          .send(SupervisorCommand::WorkerEvent(WorkerEvent::Ready {
            worker_id: handle.worker_id,
          }))
          .await;
      }
      Ok(Message::Event { name, payload }) => {
        handle.dispatch_event(&name, &payload).await;
        let _ = cmd_tx
          .send(SupervisorCommand::WorkerEvent(WorkerEvent::Application {
            name,
            payload,
          }))
          .await;
      }
      Ok(Message::Terminated) => {
        log::info!("worker pid={pid}: terminated ack received");
        break;
      }
      Ok(Message::BindResponse { .. }) => {
        log::warn!("worker pid={pid}: unexpected bind_response on parent side, ignoring");
      }
      Ok(Message::Shutdown) => {
        log::warn!("worker pid={pid}: unexpected shutdown message from worker, ignoring");
      }
      Err(e) if e.is_peer_termination() => break,
      Err(e) => {
        log::error!("worker pid={pid}: ipc error: {e}");
        break;
      }
    }
  }
}

async fn handle_bind_request(
  ipc: &IpcChannel,
  transport: &Transport,
  uri: &str,
) -> Result<(), IpcError> {
  match transport.obtain_listener(uri).await {
    Ok(ObtainedListener::PortReuse) => {
      ipc
        .send(&Message::BindResponse {
          uri: uri.to_string(),
          outcome: BindOutcome::PortReuse,
        })
        .await
    }
    Ok(ObtainedListener::Fd(fd)) => ipc.send_with_fd(uri.to_string(), fd).await,
    Err(e) => {
      ipc
        .send(&Message::BindResponse {
          uri: uri.to_string(),
          outcome: BindOutcome::Failed {
            message: e.to_string(),
          },
        })
        .await
    }
  }
}
