//! Wire protocol spoken on the control and data sockets.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, Frame};
pub use message::{
    cmd, ControlCommand, ControlRequest, EngineMessage, StatusReply, TextRequest, GENERIC_COOKIE,
};
