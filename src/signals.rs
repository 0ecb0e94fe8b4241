//! OS signal dispatch for the supervisor binary (§6 "Signals").
//!
//! `INT`/`TERM` trigger a graceful stop, `USR1` triggers a rolling restart.
//! Handlers degrade silently on platforms without signal support, matching
//! the "best-effort" contract — there's nothing more to do with a
//! `signal()` registration failure than log it and carry on without that
//! signal.

use tokio::signal::unix::{signal, SignalKind};

use crate::supervisor::Supervisor;

/// Run until a stop-triggering signal arrives (or forever if none could be
/// registered), driving `stop`/`restart` on `supervisor` as signals land.
/// Returns once a graceful stop has been issued.
pub async fn run_until_stop(supervisor: Supervisor) {
  let mut sigint = match signal(SignalKind::interrupt()) {
    Ok(s) => Some(s),
    Err(e) => {
      log::warn!("signal handling unavailable for SIGINT: {e}");
      None
    }
  };
  let mut sigterm = match signal(SignalKind::terminate()) {
    Ok(s) => Some(s),
    Err(e) => {
      log::warn!("signal handling unavailable for SIGTERM: {e}");
      None
    }
  };
  let mut sigusr1 = match signal(SignalKind::user_defined1()) {
    Ok(s) => Some(s),
    Err(e) => {
      log::warn!("signal handling unavailable for SIGUSR1: {e}");
      None
    }
  };

  loop {
    tokio::select! {
      _ = recv_or_pending(&mut sigint) => {
        log::info!("received SIGINT, stopping");
        break;
      }
      _ = recv_or_pending(&mut sigterm) => {
        log::info!("received SIGTERM, stopping");
        break;
      }
      _ = recv_or_pending(&mut sigusr1) => {
        log::info!("received SIGUSR1, rolling restart");
        if let Err(e) = supervisor.restart().await {
          log::error!("rolling restart failed: {e}");
        }
      }
    }
  }

  if let Err(e) = supervisor.stop().await {
    log::error!("graceful stop failed: {e}");
  }
}

async fn recv_or_pending(signal: &mut Option<tokio::signal::unix::Signal>) {
  match signal {
    Some(s) => {
      s.recv().await;
    }
    None => std::future::pending().await,
  }
}
