//! Datagram codec for the control/data wire protocol.
//!
//! Frame format (one frame per datagram):
//! ```text
//! ┌──────────┬──────────────┬───────────────────────────┐
//! │ type(1B) │ token (4B)   │   body                    │
//! │ u8       │ u32 BE       │                           │
//! └──────────┴──────────────┴───────────────────────────┘
//! ```
//! Control, text, status and message bodies are JSON. Data bodies are
//! `hook_len (1B) | hook | payload`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{Error, HookName, Result};
use crate::wire::message::{ControlRequest, EngineMessage, StatusReply, TextRequest};

/// Frame type: control request from client.
pub const FRAME_CONTROL: u8 = 0x01;
/// Frame type: text command from client.
pub const FRAME_TEXT: u8 = 0x02;
/// Frame type: status reply from engine.
pub const FRAME_STATUS: u8 = 0x03;
/// Frame type: unsolicited engine message.
pub const FRAME_MESSAGE: u8 = 0x04;
/// Frame type: client greeting, lets the engine learn the reply address.
pub const FRAME_HELLO: u8 = 0x05;
/// Frame type: hook-tagged data.
pub const FRAME_DATA: u8 = 0x10;

/// Type byte plus token.
pub const HEADER_SIZE: usize = 5;

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control { token: u32, request: ControlRequest },
    Text { token: u32, request: TextRequest },
    Status { token: u32, reply: StatusReply },
    Message { token: u32, message: EngineMessage },
    Hello { token: u32 },
    Data { token: u32, hook: HookName, payload: Bytes },
}

impl Frame {
    pub fn token(&self) -> u32 {
        match self {
            Frame::Control { token, .. }
            | Frame::Text { token, .. }
            | Frame::Status { token, .. }
            | Frame::Message { token, .. }
            | Frame::Hello { token }
            | Frame::Data { token, .. } => *token,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Control { .. } => "control",
            Frame::Text { .. } => "text",
            Frame::Status { .. } => "status",
            Frame::Message { .. } => "message",
            Frame::Hello { .. } => "hello",
            Frame::Data { .. } => "data",
        }
    }
}

/// Encode one frame into a datagram.
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
    match frame {
        Frame::Control { token, request } => {
            put_header(&mut buf, FRAME_CONTROL, *token);
            buf.extend_from_slice(&serde_json::to_vec(request)?);
        }
        Frame::Text { token, request } => {
            put_header(&mut buf, FRAME_TEXT, *token);
            buf.extend_from_slice(&serde_json::to_vec(request)?);
        }
        Frame::Status { token, reply } => {
            put_header(&mut buf, FRAME_STATUS, *token);
            buf.extend_from_slice(&serde_json::to_vec(reply)?);
        }
        Frame::Message { token, message } => {
            put_header(&mut buf, FRAME_MESSAGE, *token);
            buf.extend_from_slice(&serde_json::to_vec(message)?);
        }
        Frame::Hello { token } => {
            put_header(&mut buf, FRAME_HELLO, *token);
        }
        Frame::Data {
            token,
            hook,
            payload,
        } => {
            buf.reserve(1 + hook.as_str().len() + payload.len());
            put_header(&mut buf, FRAME_DATA, *token);
            // HookName::MAX_LEN keeps this within a byte
            buf.put_u8(hook.as_str().len() as u8);
            buf.extend_from_slice(hook.as_str().as_bytes());
            buf.extend_from_slice(payload);
        }
    }
    Ok(buf.freeze())
}

fn put_header(buf: &mut BytesMut, frame_type: u8, token: u32) {
    buf.put_u8(frame_type);
    buf.put_u32(token);
}

/// Decode one datagram.
pub fn decode(datagram: &[u8]) -> Result<Frame> {
    if datagram.len() < HEADER_SIZE {
        return Err(Error::protocol(format!(
            "Frame too short: {} bytes",
            datagram.len()
        )));
    }
    let mut buf = datagram;
    let frame_type = buf.get_u8();
    let token = buf.get_u32();

    let frame = match frame_type {
        FRAME_CONTROL => Frame::Control {
            token,
            request: serde_json::from_slice(buf)?,
        },
        FRAME_TEXT => Frame::Text {
            token,
            request: serde_json::from_slice(buf)?,
        },
        FRAME_STATUS => Frame::Status {
            token,
            reply: serde_json::from_slice(buf)?,
        },
        FRAME_MESSAGE => Frame::Message {
            token,
            message: serde_json::from_slice(buf)?,
        },
        FRAME_HELLO => Frame::Hello { token },
        FRAME_DATA => {
            if !buf.has_remaining() {
                return Err(Error::protocol("Data frame missing hook length"));
            }
            let hook_len = buf.get_u8() as usize;
            if buf.remaining() < hook_len {
                return Err(Error::protocol(format!(
                    "Data frame hook truncated: want {} bytes, have {}",
                    hook_len,
                    buf.remaining()
                )));
            }
            let hook = std::str::from_utf8(&buf[..hook_len])
                .map_err(|e| Error::protocol(format!("Data frame hook not UTF-8: {}", e)))?;
            let hook = HookName::new(hook)?;
            buf.advance(hook_len);
            Frame::Data {
                token,
                hook,
                payload: Bytes::copy_from_slice(buf),
            }
        }
        other => {
            return Err(Error::protocol(format!(
                "Unexpected frame type: 0x{:02X}",
                other
            )));
        }
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EngineErrno, NodePath};
    use crate::wire::message::{cmd, ControlCommand};

    #[test]
    fn test_data_frame_layout() {
        let frame = Frame::Data {
            token: 7,
            hook: HookName::new("b").unwrap(),
            payload: Bytes::from_static(b"test\0"),
        };
        let wire = encode(&frame).unwrap();
        assert_eq!(
            wire.as_ref(),
            &[FRAME_DATA, 0, 0, 0, 7, 1, b'b', b't', b'e', b's', b't', 0]
        );
        assert_eq!(decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_control_frame_decodes_command() {
        let request = ControlRequest::new(
            NodePath::new("test hub:").unwrap(),
            &ControlCommand::Shutdown,
        )
        .unwrap();
        let wire = encode(&Frame::Control { token: 3, request }).unwrap();
        match decode(&wire).unwrap() {
            Frame::Control { token, request } => {
                assert_eq!(token, 3);
                assert_eq!(request.cmd, cmd::SHUTDOWN);
                assert_eq!(request.path.as_str(), "test hub:");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_status_frame_carries_errno() {
        let wire = encode(&Frame::Status {
            token: 9,
            reply: StatusReply::err(EngineErrno::AlreadyExists),
        })
        .unwrap();
        let frame = decode(&wire).unwrap();
        assert_eq!(frame.token(), 9);
        assert_eq!(frame.kind(), "status");
    }

    #[test]
    fn test_rejects_short_frame() {
        let err = decode(&[FRAME_HELLO, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("Frame too short"));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = decode(&[0x7F, 0, 0, 0, 1]).unwrap_err();
        assert!(err.to_string().contains("0x7F"));
    }

    #[test]
    fn test_rejects_truncated_hook() {
        let err = decode(&[FRAME_DATA, 0, 0, 0, 1, 4, b'a']).unwrap_err();
        assert!(err.to_string().contains("hook truncated"));
    }

    #[test]
    fn test_empty_data_payload() {
        let wire = [FRAME_DATA, 0, 0, 0, 0, 1, b'a'];
        match decode(&wire).unwrap() {
            Frame::Data { hook, payload, .. } => {
                assert_eq!(hook.as_str(), "a");
                assert!(payload.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
