//! Minimal worker used by integration tests: connects back to its parent,
//! answers `ping` with `pong`, honors `bind_request` for a uri given on its
//! own command line, and exits cleanly on shutdown — unless told to
//! `--ignore-shutdown`, in which case it never acks, to exercise the
//! supervisor's stop-escalates-to-kill path.
//!
//! Usage: `fixture_worker <ipc_socket_path> [listener_uri] [--ignore-shutdown]`

use std::path::PathBuf;

use prefork::worker::WorkerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

  let mut args: Vec<String> = std::env::args().skip(1).collect();
  let ignore_shutdown = {
    let before = args.len();
    args.retain(|a| a != "--ignore-shutdown");
    args.len() != before
  };

  let mut args = args.into_iter();
  let socket_path = PathBuf::from(
    args
      .next()
      .ok_or_else(|| anyhow::anyhow!("missing ipc socket path argument"))?,
  );
  let listener_uri = args.next();

  let runtime = WorkerRuntime::connect(&socket_path).await?;

  runtime
    .on_message("ping", {
      let runtime = runtime.clone();
      move |_payload| {
        let runtime = runtime.clone();
        tokio::spawn(async move {
          if let Err(e) = runtime.send("pong", serde_json::Value::Null).await {
            log::error!("fixture_worker: failed to send pong: {e}");
          }
        });
      }
    })
    .await;

  if let Some(uri) = listener_uri {
    match runtime.get_listener(&uri).await {
      Ok(obtained) => {
        let listener = obtained.into_tcp_listener()?;
        let local_addr = listener.local_addr()?;
        log::info!("fixture_worker: listening for {uri} at {local_addr}");
        runtime
          .send(
            "listening",
            serde_json::json!({ "port": local_addr.port() }),
          )
          .await?;

        let runtime_for_accept = runtime.clone();
        tokio::spawn(async move {
          match listener.accept().await {
            Ok((_socket, peer)) => {
              log::info!("fixture_worker: accepted client connection from {peer}");
              if let Err(e) = runtime_for_accept.send("client_connected", serde_json::Value::Null).await {
                log::error!("fixture_worker: failed to send client_connected: {e}");
              }
            }
            Err(e) => log::error!("fixture_worker: accept failed: {e}"),
          }
        });
      }
      Err(e) => {
        log::error!("fixture_worker: get_listener({uri}) failed: {e}");
      }
    }
  }

  runtime.ready().await?;
  log::info!("fixture_worker: ready");

  runtime.await_shutdown().await;

  if ignore_shutdown {
    log::warn!("fixture_worker: ignoring shutdown as instructed, hanging");
    std::future::pending::<()>().await;
  }

  log::info!("fixture_worker: shutting down");
  runtime.terminated().await?;

  Ok(())
}
