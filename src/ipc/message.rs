//! Wire messages exchanged between the supervisor and a worker over the
//! length-framed IPC channel (§4, §6).

use serde::{Deserialize, Serialize};

/// Outcome of a `BindRequest`, carried in the matching `BindResponse` frame.
///
/// `FdPassed` does not carry the descriptor itself: bincode has no concept of
/// an open file descriptor, so the fd rides along out-of-band via a
/// dedicated `sendmsg`/`recvmsg` call immediately following this frame (see
/// `ipc::fdpass`). The caller must only treat `BindResponse` as complete
/// after it has also drained that fd frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BindOutcome {
  /// The worker should bind its own listener for `uri` using port reuse.
  PortReuse,
  /// A listener fd for `uri` is attached to the frame that follows this one.
  FdPassed,
  /// The supervisor could not prepare a listener for `uri`.
  Failed { message: String },
}

/// A message exchanged over the IPC channel (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
  /// Worker → supervisor: "I need a listener for this uri."
  BindRequest { uri: String },
  /// Supervisor → worker: reply to a `BindRequest`.
  BindResponse { uri: String, outcome: BindOutcome },
  /// Worker → supervisor: worker has finished its startup hook and is
  /// accepting connections.
  Ready,
  /// Either direction: an application-defined named event with an arbitrary
  /// JSON payload (§4.2 "application events").
  Event {
    name: String,
    payload: serde_json::Value,
  },
  /// Supervisor → worker: begin graceful shutdown.
  Shutdown,
  /// Worker → supervisor: shutdown hook has completed; safe to reap.
  Terminated,
}
