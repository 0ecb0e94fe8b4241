//! Length-framed, fd-capable IPC between the supervisor and its workers
//! (§4.2, §6).

mod channel;
mod fdpass;
mod frame;
mod message;

pub use channel::{IpcChannel, PeerId};
pub use message::{BindOutcome, Message};
