//! The Supervisor (Watcher): orchestrates the worker pool (§4.5).
//!
//! Every operation that touches pool state — `start`, `stop`, `restart`,
//! `broadcast`, worker-exit handling, and event fan-out — is a command sent
//! over one `mpsc` channel to a single actor task spawned by `Supervisor::
//! new` (§5 "implementations that use OS threads must serialize Supervisor
//! state behind a single mutex", §9's actor translation note). `Supervisor`
//! itself is just a cloneable sender: it owns no pool state directly, so
//! there is nothing to race between two handles calling `stop()` and
//! `restart()` concurrently — both commands simply queue and are processed
//! one at a time by the same task.

use std::collections::HashMap;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::process::Stdio;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::SupervisorError;
use crate::transport::{Strategy, Transport};
use crate::worker_handle::{WorkerExit, WorkerExitOutcome, WorkerHandle, WorkerSpawnContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
  Idle,
  Running,
  Stopping,
  Errored,
}

/// Events surfaced by a worker's IPC receive loop that the Supervisor needs
/// to react to (readiness tracking, application event fan-out).
pub enum WorkerEvent {
  Ready {
    worker_id: u64,
  },
  Application {
    name: String,
    payload: serde_json::Value,
  },
}

type EventSubscriber = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Every request the actor task understands. `WorkerExited`/`WorkerEvent`
/// arrive from worker-driving tasks; the rest are the public API calls on
/// `Supervisor`, each carrying a oneshot reply channel.
pub enum SupervisorCommand {
  Start(oneshot::Sender<Result<(), SupervisorError>>),
  Stop(oneshot::Sender<Result<(), SupervisorError>>),
  Restart(oneshot::Sender<Result<(), SupervisorError>>),
  Broadcast(
    String,
    serde_json::Value,
    oneshot::Sender<Result<(), SupervisorError>>,
  ),
  OnEvent(String, EventSubscriber),
  State(oneshot::Sender<SupervisorState>),
  WorkerCount(oneshot::Sender<usize>),
  WorkerPids(oneshot::Sender<Vec<u32>>),
  WorkerExited(WorkerExit),
  WorkerEvent(WorkerEvent),
}

/// Everything the actor task owns exclusively; never touched from outside
/// `command_loop` and the functions it calls directly.
struct ActorState {
  config: Config,
  transport: Arc<Transport>,
  state: SupervisorState,
  workers: HashMap<u64, Arc<WorkerHandle>>,
  next_worker_id: u64,
  ipc_listener: Option<UnixListener>,
  subscribers: HashMap<String, Vec<EventSubscriber>>,
}

/// Handle-like, cheaply cloneable entry point for the cluster. Construct one
/// with `Supervisor::new`, then drive the pool with `start`/`stop`/`restart`/
/// `broadcast`. Cloning shares the same underlying actor task.
#[derive(Clone)]
pub struct Supervisor {
  cmd_tx: mpsc::Sender<SupervisorCommand>,
}

impl Supervisor {
  /// Build a Supervisor from a validated `Config`. Fails synchronously
  /// (§7 `MisuseError`) if the config is invalid or if called from inside a
  /// worker process (§9 "process-wide singleton check").
  pub fn new(config: Config) -> Result<Self, SupervisorError> {
    config.validate()?;
    if crate::worker::is_worker() {
      return Err(crate::error::ConfigError::CalledFromWorker.into());
    }

    let strategy = config.transport_strategy.unwrap_or_else(Strategy::detect);
    let transport = Arc::new(Transport::new(strategy));
    let (cmd_tx, cmd_rx) = mpsc::channel(1024);

    let state = ActorState {
      config,
      transport,
      state: SupervisorState::Idle,
      workers: HashMap::new(),
      next_worker_id: 0,
      ipc_listener: None,
      subscribers: HashMap::new(),
    };

    let loop_tx = cmd_tx.clone();
    tokio::spawn(command_loop(state, cmd_rx, loop_tx));

    Ok(Supervisor { cmd_tx })
  }

  pub async fn state(&self) -> SupervisorState {
    self.call(SupervisorCommand::State).await.unwrap_or(SupervisorState::Idle)
  }

  pub async fn worker_count(&self) -> usize {
    self.call(SupervisorCommand::WorkerCount).await.unwrap_or(0)
  }

  /// Pids of the currently live workers, for observability and tests.
  pub async fn worker_pids(&self) -> Vec<u32> {
    self.call(SupervisorCommand::WorkerPids).await.unwrap_or_default()
  }

  /// Register a callback for application events named `name`, fired for
  /// every worker in the pool (§4.5 `message_subscribers`). Handlers for the
  /// same name run in registration order. See also `WorkerHandle::on_event`
  /// for subscribing to a single worker instead of the whole pool.
  pub async fn on_event<F>(&self, name: &str, handler: F)
  where
    F: Fn(serde_json::Value) + Send + Sync + 'static,
  {
    let _ = self
      .cmd_tx
      .send(SupervisorCommand::OnEvent(name.to_string(), Arc::new(handler)))
      .await;
  }

  /// Start the pool: bind the IPC server, then spawn `worker_count` workers
  /// in series (§4.5 Start).
  pub async fn start(&self) -> Result<(), SupervisorError> {
    self.call_fallible(SupervisorCommand::Start).await
  }

  /// Idempotent graceful stop: ask every worker to shut down, wait up to
  /// `worker_timeout` each, killing stragglers, then tear down the IPC
  /// server (§4.5 Stop).
  pub async fn stop(&self) -> Result<(), SupervisorError> {
    self.call_fallible(SupervisorCommand::Stop).await
  }

  /// Rolling restart: replace each worker in order, waiting for it to exit
  /// before spawning its replacement, so capacity never drops below
  /// `worker_count - 1` (§4.5 Restart).
  pub async fn restart(&self) -> Result<(), SupervisorError> {
    self.call_fallible(SupervisorCommand::Restart).await
  }

  /// Broadcast an event to every worker; best-effort per worker, failures
  /// aggregated rather than aborting the rest (§4.5 Broadcast, §9 Open
  /// Question — this implementation surfaces partial failure).
  pub async fn broadcast(&self, name: &str, payload: serde_json::Value) -> Result<(), SupervisorError> {
    let name = name.to_string();
    self
      .call_fallible(move |tx| SupervisorCommand::Broadcast(name, payload, tx))
      .await
  }

  async fn call<T>(
    &self,
    build: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
  ) -> Result<T, SupervisorError> {
    let (tx, rx) = oneshot::channel();
    if self.cmd_tx.send(build(tx)).await.is_err() {
      return Err(actor_gone());
    }
    rx.await.map_err(|_| actor_gone())
  }

  async fn call_fallible(
    &self,
    build: impl FnOnce(oneshot::Sender<Result<(), SupervisorError>>) -> SupervisorCommand,
  ) -> Result<(), SupervisorError> {
    self.call(build).await?
  }
}

fn actor_gone() -> SupervisorError {
  SupervisorError::MisuseError("supervisor actor task is no longer running".to_string())
}

/// The single serialization point for all pool state (§5, §9). Processes one
/// command at a time; `start`/`stop`/`restart` each run to completion before
/// the next queued command (including a `WorkerExited` report) is handled,
/// which is what makes "at most one worker Starting" and "no respawn racing
/// a restart" hold without a separate `start_gate` mutex.
async fn command_loop(
  mut state: ActorState,
  mut cmd_rx: mpsc::Receiver<SupervisorCommand>,
  cmd_tx: mpsc::Sender<SupervisorCommand>,
) {
  while let Some(cmd) = cmd_rx.recv().await {
    match cmd {
      SupervisorCommand::Start(reply) => {
        let _ = reply.send(do_start(&mut state, &cmd_tx).await);
      }
      SupervisorCommand::Stop(reply) => {
        let _ = reply.send(do_stop(&mut state).await);
      }
      SupervisorCommand::Restart(reply) => {
        let _ = reply.send(do_restart(&mut state, &cmd_tx).await);
      }
      SupervisorCommand::Broadcast(name, payload, reply) => {
        let _ = reply.send(do_broadcast(&state, &name, payload).await);
      }
      SupervisorCommand::OnEvent(name, handler) => {
        state.subscribers.entry(name).or_default().push(handler);
      }
      SupervisorCommand::State(reply) => {
        let _ = reply.send(state.state);
      }
      SupervisorCommand::WorkerCount(reply) => {
        let _ = reply.send(state.workers.len());
      }
      SupervisorCommand::WorkerPids(reply) => {
        let _ = reply.send(state.workers.values().map(|h| h.pid).collect());
      }
      SupervisorCommand::WorkerExited(exit) => handle_worker_exited(&mut state, &cmd_tx, exit).await,
      SupervisorCommand::WorkerEvent(WorkerEvent::Ready { worker_id }) => {
        log::debug!("worker_id={worker_id} reported ready");
      }
      SupervisorCommand::WorkerEvent(WorkerEvent::Application { name, payload }) => {
        if let Some(handlers) = state.subscribers.get(&name) {
          for handler in handlers {
            handler(payload.clone());
          }
        }
      }
    }
  }
}

async fn do_start(
  state: &mut ActorState,
  cmd_tx: &mpsc::Sender<SupervisorCommand>,
) -> Result<(), SupervisorError> {
  if state.state != SupervisorState::Idle {
    return Err(SupervisorError::MisuseError(
      "start called while not idle".to_string(),
    ));
  }
  state.state = SupervisorState::Running;

  if let Err(e) = bind_ipc_server(state).await {
    // Errored is observable only through this returned error; the state
    // itself collapses straight back to Idle so the Supervisor is
    // reusable from a fresh `start` (§4.5 State machine).
    state.state = SupervisorState::Idle;
    return Err(e);
  }

  for index in 0..state.config.worker_count {
    if let Err(e) = spawn_one(state, cmd_tx, index).await {
      log::error!("pool start failed at worker {index}: {e}");
      let _ = do_stop(state).await;
      return Err(e);
    }
  }

  Ok(())
}

async fn bind_ipc_server(state: &mut ActorState) -> Result<(), SupervisorError> {
  let path = &state.config.ipc_socket_path;
  if path.exists() {
    std::fs::remove_file(path).map_err(SupervisorError::Io)?;
  }
  let std_listener = StdUnixListener::bind(path).map_err(SupervisorError::Io)?;
  std_listener.set_nonblocking(true).map_err(SupervisorError::Io)?;
  let listener = UnixListener::from_std(std_listener).map_err(SupervisorError::Io)?;
  state.ipc_listener = Some(listener);
  Ok(())
}

/// Spawn and wire up one worker. Called only from within `command_loop`
/// (directly or via `Start`/`Restart`/respawn), so "at most one worker in
/// Starting at a time" (§3, §4.5) holds by construction: nothing else can
/// run concurrently on `state`.
async fn spawn_one(
  state: &mut ActorState,
  cmd_tx: &mpsc::Sender<SupervisorCommand>,
  index: usize,
) -> Result<(), SupervisorError> {
  let worker_id = state.next_worker_id;
  state.next_worker_id += 1;
  let worker_command = &state.config.worker_command;

  let mut command = Command::new(&worker_command[0]);
  command
    .arg(&state.config.ipc_socket_path)
    .args(&worker_command[1..])
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  let mut child = command
    .spawn()
    .map_err(|e| SupervisorError::WorkerStartFailed(format!("spawn failed: {e}")))?;
  let pid = child.id().unwrap_or(0);

  let accept_result = tokio::time::timeout(
    state.config.worker_timeout,
    accept_connect_back(&mut state.ipc_listener),
  )
  .await;

  let (stream, peer_pid) = match accept_result {
    Ok(Ok(pair)) => pair,
    Ok(Err(e)) => {
      let _ = child.kill().await;
      return Err(SupervisorError::WorkerStartFailed(format!(
        "ipc accept failed: {e}"
      )));
    }
    Err(_) => {
      let _ = child.kill().await;
      return Err(SupervisorError::Timeout {
        pid: Some(pid),
        context: "worker connect-back".to_string(),
      });
    }
  };

  let ctx = WorkerSpawnContext {
    worker_id,
    index,
    transport: state.transport.clone(),
    cmd_tx: cmd_tx.clone(),
  };

  let handle = crate::worker_handle::spawn(ctx, child, stream, peer_pid).await?;
  log::info!("worker[{index}] pid={} spawned", handle.pid);
  state.workers.insert(worker_id, handle);

  Ok(())
}

async fn do_stop(state: &mut ActorState) -> Result<(), SupervisorError> {
  if state.state == SupervisorState::Idle {
    return Ok(());
  }
  state.state = SupervisorState::Stopping;

  let handles: Vec<Arc<WorkerHandle>> = state.workers.drain().map(|(_, h)| h).collect();

  let timeout = state.config.worker_timeout;
  let mut joins = JoinSet::new();
  for handle in handles {
    joins.spawn(async move {
      if let Err(e) = handle.request_shutdown().await {
        log::warn!(
          "worker[{}] pid={}: shutdown send failed: {e}",
          handle.index,
          handle.pid
        );
      }
      match tokio::time::timeout(timeout, handle.run()).await {
        Ok(_) => None,
        Err(_) => {
          log::warn!(
            "worker[{}] pid={} did not exit within {timeout:?}, killing",
            handle.index,
            handle.pid
          );
          handle
            .kill()
            .err()
            .map(|e| format!("worker[{}] pid={}: {e}", handle.index, handle.pid))
        }
      }
    });
  }

  let mut failures = Vec::new();
  while let Some(result) = joins.join_next().await {
    if let Ok(Some(failure)) = result {
      failures.push(failure);
    }
  }

  state.ipc_listener = None;
  let _ = std::fs::remove_file(&state.config.ipc_socket_path);
  state.state = SupervisorState::Idle;

  if failures.is_empty() {
    Ok(())
  } else {
    Err(SupervisorError::StopFailed(failures.join("; ")))
  }
}

async fn do_restart(
  state: &mut ActorState,
  cmd_tx: &mpsc::Sender<SupervisorCommand>,
) -> Result<(), SupervisorError> {
  if state.state != SupervisorState::Running {
    return Err(SupervisorError::MisuseError(
      "restart called while not running".to_string(),
    ));
  }

  let ids: Vec<u64> = state.workers.keys().copied().collect();
  for id in ids {
    let Some(handle) = state.workers.remove(&id) else {
      continue;
    };
    let index = handle.index;

    if let Err(e) = handle.request_shutdown().await {
      log::warn!("restart: worker[{index}] shutdown send failed: {e}");
    }

    if tokio::time::timeout(state.config.worker_timeout, handle.run())
      .await
      .is_err()
    {
      log::warn!("restart: worker[{index}] did not exit within deadline, killing");
      if let Err(e) = handle.kill() {
        log::warn!("restart: failed to kill worker[{index}]: {e}");
      }
    }

    if let Err(e) = spawn_one(state, cmd_tx, index).await {
      log::error!("restart: failed to respawn worker[{index}]: {e}");
      return Err(SupervisorError::RespawnFailed(e.to_string()));
    }
  }

  Ok(())
}

async fn do_broadcast(
  state: &ActorState,
  name: &str,
  payload: serde_json::Value,
) -> Result<(), SupervisorError> {
  let mut failures = Vec::new();
  for handle in state.workers.values() {
    if let Err(e) = handle.send(name, payload.clone()).await {
      failures.push(format!("worker[{}] pid={}: {e}", handle.index, handle.pid));
    }
  }

  if failures.is_empty() {
    Ok(())
  } else {
    Err(SupervisorError::StopFailed(failures.join("; ")))
  }
}

async fn accept_connect_back(
  listener: &mut Option<UnixListener>,
) -> std::io::Result<(UnixStream, u32)> {
  let listener = listener
    .as_ref()
    .expect("ipc server must be bound before accepting workers");
  let (stream, _addr) = listener.accept().await?;
  let pid = stream
    .peer_cred()
    .ok()
    .and_then(|c| c.pid())
    .map(|p| p as u32)
    .unwrap_or(0);
  Ok((stream, pid))
}

/// React to one worker's exit: respawns into the same index if `running`
/// and the exit wasn't part of a stop/restart already draining `workers`
/// (§4.5 Respawn).
async fn handle_worker_exited(
  state: &mut ActorState,
  cmd_tx: &mpsc::Sender<SupervisorCommand>,
  exit: WorkerExit,
) {
  let still_running = state.state == SupervisorState::Running;
  let Some(handle) = state.workers.remove(&exit.worker_id) else {
    // Already removed by stop()/restart(); nothing more to do.
    return;
  };

  match exit.outcome {
    WorkerExitOutcome::Clean => log::info!("worker pid={} exited cleanly", exit.pid),
    WorkerExitOutcome::Errored => log::error!("worker pid={} exited with an error", exit.pid),
    WorkerExitOutcome::Killed => log::warn!("worker pid={} was killed", exit.pid),
  }

  if !still_running {
    return;
  }

  if let Err(e) = spawn_one(state, cmd_tx, handle.index).await {
    log::error!("respawn failed for worker index {}: {e}", handle.index);
    state.state = SupervisorState::Errored;
    let _ = do_stop(state).await;
  }
}
