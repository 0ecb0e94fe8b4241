//! Length-framed read/write of `Message` values over a `UnixStream`.
//!
//! Frame layout is a 4-byte big-endian length header followed by a
//! `bincode`-encoded payload of that many bytes (§4.2, §6). This is
//! deliberately big-endian: it is a concrete wire-format requirement of the
//! protocol, not a style choice, so it does not follow the teacher's
//! little-endian framing in its own daemon protocol.

use tokio::net::UnixStream;

use crate::error::IpcError;
use crate::ipc::message::Message;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame(stream: &UnixStream, msg: &Message) -> Result<(), IpcError> {
  let payload = bincode::serde::encode_to_vec(msg, bincode::config::standard())?;
  let len: u32 = payload
    .len()
    .try_into()
    .map_err(|_| IpcError::MalformedFrame("frame payload too large to encode length".into()))?;

  let mut buf = Vec::with_capacity(4 + payload.len());
  buf.extend_from_slice(&len.to_be_bytes());
  buf.extend_from_slice(&payload);
  write_all(stream, &buf).await
}

pub async fn read_frame(stream: &UnixStream) -> Result<Message, IpcError> {
  let mut header = [0u8; 4];
  read_exact(stream, &mut header).await?;
  let len = u32::from_be_bytes(header) as usize;
  if len > MAX_FRAME_LEN {
    return Err(IpcError::MalformedFrame(format!(
      "frame length {len} exceeds max of {MAX_FRAME_LEN}"
    )));
  }

  let mut payload = vec![0u8; len];
  read_exact(stream, &mut payload).await?;
  let (msg, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
  Ok(msg)
}

async fn write_all(stream: &UnixStream, buf: &[u8]) -> Result<(), IpcError> {
  let mut written = 0;
  while written < buf.len() {
    stream.writable().await?;
    match stream.try_write(&buf[written..]) {
      Ok(0) => return Err(IpcError::PeerGone("peer closed write side".into())),
      Ok(n) => written += n,
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
      Err(e) => return Err(IpcError::Io(e)),
    }
  }
  Ok(())
}

async fn read_exact(stream: &UnixStream, buf: &mut [u8]) -> Result<(), IpcError> {
  let mut filled = 0;
  while filled < buf.len() {
    stream.readable().await?;
    match stream.try_read(&mut buf[filled..]) {
      Ok(0) => return Err(IpcError::PeerGone("peer closed during frame read".into())),
      Ok(n) => filled += n,
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
      Err(e) => return Err(IpcError::Io(e)),
    }
  }
  Ok(())
}
