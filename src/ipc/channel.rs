//! `IpcChannel`: a `Message`-typed, fd-capable channel over a `UnixStream`.
//!
//! Mirrors the teacher's pattern of a shared stream guarded by a send mutex
//! (`daemon_protocol.rs`): many tasks may want to send on the same
//! connection, but frames (and any fd that rides with them) must not
//! interleave on the wire.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::IpcError;
use crate::ipc::message::{BindOutcome, Message};
use crate::ipc::{fdpass, frame};

/// Identity of the process on the other end of the channel, captured at
/// connect time so log lines can be attributed even after the peer exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId {
  pub pid: u32,
}

pub struct IpcChannel {
  stream: Arc<UnixStream>,
  send_mutex: Mutex<()>,
  peer: PeerId,
}

impl IpcChannel {
  pub fn new(stream: UnixStream, peer: PeerId) -> Self {
    Self {
      stream: Arc::new(stream),
      send_mutex: Mutex::new(()),
      peer,
    }
  }

  pub fn peer(&self) -> PeerId {
    self.peer
  }

  /// Send a message with no attached descriptor.
  pub async fn send(&self, msg: &Message) -> Result<(), IpcError> {
    let _guard = self.send_mutex.lock().await;
    frame::write_frame(&self.stream, msg).await
  }

  /// Send a `BindResponse { outcome: FdPassed, .. }` together with the
  /// listener descriptor it refers to, atomically with respect to other
  /// senders on this channel.
  pub async fn send_with_fd(&self, uri: String, fd: RawFd) -> Result<(), IpcError> {
    let _guard = self.send_mutex.lock().await;
    let msg = Message::BindResponse {
      uri,
      outcome: BindOutcome::FdPassed,
    };
    frame::write_frame(&self.stream, &msg).await?;
    fdpass::send_fd(&self.stream, fd).await
  }

  /// Receive the next message. Callers that get back a `BindResponse` with
  /// `BindOutcome::FdPassed` must immediately call `recv_fd` before doing
  /// anything else with this channel, since the descriptor is the very next
  /// thing on the wire.
  pub async fn recv(&self) -> Result<Message, IpcError> {
    frame::read_frame(&self.stream).await
  }

  /// Receive a descriptor sent via `send_with_fd`.
  pub async fn recv_fd(&self) -> Result<OwnedFd, IpcError> {
    fdpass::recv_fd(&self.stream).await
  }

  pub fn as_raw_fd(&self) -> RawFd {
    self.stream.as_raw_fd()
  }
}
