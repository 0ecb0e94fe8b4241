//! End-to-end scenarios against the real `Supervisor` driving the
//! `fixture_worker` binary (§8 "End-to-end scenarios").

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prefork::config::Config;
use prefork::transport::Strategy;
use prefork::Supervisor;

fn fixture_worker_path() -> PathBuf {
  PathBuf::from(env!("CARGO_BIN_EXE_fixture_worker"))
}

fn test_config(worker_count: usize, dir: &tempfile::TempDir) -> Config {
  Config::new(
    vec![fixture_worker_path().to_string_lossy().to_string()],
    worker_count,
  )
  .with_ipc_socket_path(dir.path().join("prefork-test.sock"))
  .with_worker_timeout(Duration::from_secs(3))
}

#[tokio::test]
async fn pool_start_and_broadcast_ping_pong() {
  let dir = tempfile::tempdir().unwrap();
  let supervisor = Supervisor::new(test_config(3, &dir)).unwrap();
  supervisor.start().await.unwrap();
  assert_eq!(supervisor.worker_count().await, 3);

  let pongs = Arc::new(Mutex::new(0usize));
  let pongs_for_handler = pongs.clone();
  supervisor
    .on_event("pong", move |_payload| {
      *pongs_for_handler.lock().unwrap() += 1;
    })
    .await;

  supervisor
    .broadcast("ping", serde_json::Value::Null)
    .await
    .unwrap();

  tokio::time::sleep(Duration::from_millis(500)).await;
  assert_eq!(*pongs.lock().unwrap(), 3);

  supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn crash_respawn_restores_pool_size() {
  let dir = tempfile::tempdir().unwrap();
  let supervisor = Supervisor::new(test_config(2, &dir)).unwrap();
  supervisor.start().await.unwrap();

  let original_pids: std::collections::HashSet<u32> =
    supervisor.worker_pids().await.into_iter().collect();
  assert_eq!(original_pids.len(), 2);

  let victim = *original_pids.iter().next().unwrap();
  nix::sys::signal::kill(
    nix::unistd::Pid::from_raw(victim as i32),
    nix::sys::signal::Signal::SIGKILL,
  )
  .unwrap();

  tokio::time::sleep(Duration::from_millis(500)).await;

  let new_pids: std::collections::HashSet<u32> =
    supervisor.worker_pids().await.into_iter().collect();
  assert_eq!(new_pids.len(), 2);
  assert!(!new_pids.contains(&victim));
  assert_eq!(
    new_pids.intersection(&original_pids).count(),
    1,
    "the surviving worker's pid should be unchanged"
  );

  supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn graceful_stop_completes_without_force_kill() {
  let dir = tempfile::tempdir().unwrap();
  let supervisor = Supervisor::new(test_config(2, &dir)).unwrap();
  supervisor.start().await.unwrap();

  supervisor.stop().await.unwrap();
  assert_eq!(supervisor.worker_count().await, 0);
}

#[tokio::test]
async fn rolling_restart_replaces_every_worker() {
  let dir = tempfile::tempdir().unwrap();
  let supervisor = Supervisor::new(test_config(4, &dir)).unwrap();
  supervisor.start().await.unwrap();
  assert_eq!(supervisor.worker_count().await, 4);

  let original_pids: std::collections::HashSet<u32> =
    supervisor.worker_pids().await.into_iter().collect();
  assert_eq!(original_pids.len(), 4);

  supervisor.restart().await.unwrap();
  assert_eq!(supervisor.worker_count().await, 4);

  let new_pids: std::collections::HashSet<u32> =
    supervisor.worker_pids().await.into_iter().collect();
  assert_eq!(new_pids.len(), 4);
  assert!(
    original_pids.is_disjoint(&new_pids),
    "restart should replace every worker's pid: {original_pids:?} vs {new_pids:?}"
  );

  supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn stop_escalates_to_kill_on_unresponsive_worker() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = test_config(1, &dir);
  config.worker_timeout = Duration::from_millis(300);
  config.worker_command.push("--ignore-shutdown".to_string());

  let supervisor = Supervisor::new(config).unwrap();
  supervisor.start().await.unwrap();
  assert_eq!(supervisor.worker_count().await, 1);

  let pid = supervisor.worker_pids().await[0];

  let started = tokio::time::Instant::now();
  supervisor.stop().await.unwrap();
  let elapsed = started.elapsed();

  assert_eq!(supervisor.worker_count().await, 0);
  assert!(
    elapsed >= Duration::from_millis(300),
    "stop should have waited out worker_timeout before escalating to kill, took {elapsed:?}"
  );
  assert!(
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err(),
    "worker process should have been force-killed"
  );
}

#[tokio::test]
async fn fd_passing_strategy_serves_a_tcp_listener() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = test_config(1, &dir).with_transport_strategy(Strategy::FdPassing);
  config.worker_command.push("tcp://127.0.0.1:0".to_string());

  let supervisor = Supervisor::new(config).unwrap();
  supervisor.start().await.unwrap();
  assert_eq!(supervisor.worker_count().await, 1);

  let port = Arc::new(Mutex::new(None::<u16>));
  let port_for_handler = port.clone();
  supervisor
    .on_event("listening", move |payload| {
      *port_for_handler.lock().unwrap() = payload.get("port").and_then(|v| v.as_u64()).map(|p| p as u16);
    })
    .await;

  let connected = Arc::new(Mutex::new(false));
  let connected_for_handler = connected.clone();
  supervisor
    .on_event("client_connected", move |_payload| {
      *connected_for_handler.lock().unwrap() = true;
    })
    .await;

  let bound_port = wait_for_some(|| *port.lock().unwrap(), Duration::from_secs(2))
    .await
    .expect("worker should report the bound port via the fd-passed listener");

  tokio::net::TcpStream::connect(("127.0.0.1", bound_port))
    .await
    .expect("should be able to connect to the fd-passed listener the parent bound");

  let accepted = wait_until(|| *connected.lock().unwrap(), Duration::from_secs(2)).await;
  assert!(accepted, "worker should have accepted the client connection");

  supervisor.stop().await.unwrap();
}

/// Poll `f` until it returns `Some` or `deadline` elapses.
async fn wait_for_some<T, F>(mut f: F, deadline: Duration) -> Option<T>
where
  F: FnMut() -> Option<T>,
{
  let start = tokio::time::Instant::now();
  loop {
    if let Some(value) = f() {
      return Some(value);
    }
    if start.elapsed() > deadline {
      return None;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

/// Poll `f` until it returns `true` or `deadline` elapses.
async fn wait_until<F>(mut f: F, deadline: Duration) -> bool
where
  F: FnMut() -> bool,
{
  let start = tokio::time::Instant::now();
  loop {
    if f() {
      return true;
    }
    if start.elapsed() > deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}
