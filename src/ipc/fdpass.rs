//! Passing an open file descriptor over a `UnixStream` via `SCM_RIGHTS`
//! ancillary data.
//!
//! Grounded in the fd-passing strategy shown by the pack's raw-libc example,
//! but built on the `nix` crate's safe `sendmsg`/`recvmsg` wrappers instead,
//! since `nix` is already part of the teacher's declared dependency stack.
//!
//! The descriptor is sent alongside a single sentinel byte in its own
//! `sendmsg` call, kept separate from the framed `Message` traffic in
//! `ipc::frame`. On a stream socket, ancillary data is only delivered to the
//! first `recvmsg` call that consumes bytes from the send it was attached
//! to; mixing it into a larger, possibly-partial framed read would risk
//! losing it. Sending it as its own one-byte message guarantees it arrives
//! whole on a single dedicated `recvmsg`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoSlice;
use tokio::net::UnixStream;

use crate::error::IpcError;

const SENTINEL: &[u8] = b"F";

pub async fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<(), IpcError> {
  loop {
    stream.writable().await?;
    let raw = stream.as_raw_fd();
    let iov = [IoSlice::new(SENTINEL)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    match sendmsg::<()>(raw, &iov, &cmsgs, MsgFlags::empty(), None) {
      Ok(_) => return Ok(()),
      Err(Errno::EWOULDBLOCK) => continue,
      Err(e) => return Err(IpcError::FdPassing(e)),
    }
  }
}

pub async fn recv_fd(stream: &UnixStream) -> Result<OwnedFd, IpcError> {
  loop {
    stream.readable().await?;
    let raw = stream.as_raw_fd();
    let mut sentinel = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut sentinel)];
    let mut cmsg_space = nix::cmsg_space!(RawFd);

    match recvmsg::<()>(raw, &mut iov, Some(&mut cmsg_space), MsgFlags::empty()) {
      Ok(msg) => {
        if msg.bytes == 0 {
          return Err(IpcError::PeerGone("peer closed during fd transfer".into()));
        }
        for cmsg in msg.cmsgs().map_err(|e| {
          IpcError::MalformedFrame(format!("failed to parse ancillary data: {e}"))
        })? {
          if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(received) = fds.into_iter().next() {
              return Ok(unsafe { OwnedFd::from_raw_fd(received) });
            }
          }
        }
        return Err(IpcError::MalformedFrame(
          "expected a file descriptor in ancillary data, found none".into(),
        ));
      }
      Err(Errno::EWOULDBLOCK) => continue,
      Err(e) => return Err(IpcError::FdPassing(e)),
    }
  }
}
