//! Typed message bodies carried inside wire frames.

use serde::{Deserialize, Serialize};

use crate::types::{EngineErrno, Error, HookName, NodeName, NodePath, Result, TypeName};

/// Cookie of the generic command namespace understood by every node.
pub const GENERIC_COOKIE: u32 = 1_137_070_366;

/// Generic command codes.
pub mod cmd {
    pub const SHUTDOWN: u32 = 1;
    pub const MKPEER: u32 = 2;
    pub const CONNECT: u32 = 3;
    pub const NAME: u32 = 4;
    pub const RMHOOK: u32 = 5;
    /// Command code the engine puts on replies to text commands.
    pub const TEXT_REPLY: u32 = 0x100;
}

/// Administrative command, payload shape depends on the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Connect `our_hook` on the addressed node to `peer_hook` on the node at
    /// `peer_path` (relative to the addressed node).
    Connect {
        our_hook: HookName,
        peer_path: NodePath,
        peer_hook: HookName,
    },
    /// Create a node of `peer_type` attached through `our_hook` ↔ `peer_hook`.
    MkPeer {
        our_hook: HookName,
        peer_type: TypeName,
        peer_hook: HookName,
    },
    RmHook { our_hook: HookName },
    Name { name: NodeName },
    Shutdown,
}

#[derive(Serialize, Deserialize)]
struct ConnectArgs {
    ourhook: HookName,
    path: NodePath,
    peerhook: HookName,
}

#[derive(Serialize, Deserialize)]
struct MkPeerArgs {
    ourhook: HookName,
    #[serde(rename = "type")]
    peer_type: TypeName,
    peerhook: HookName,
}

#[derive(Serialize, Deserialize)]
struct RmHookArgs {
    ourhook: HookName,
}

#[derive(Serialize, Deserialize)]
struct NameArgs {
    name: NodeName,
}

impl ControlCommand {
    pub fn code(&self) -> u32 {
        match self {
            ControlCommand::Connect { .. } => cmd::CONNECT,
            ControlCommand::MkPeer { .. } => cmd::MKPEER,
            ControlCommand::RmHook { .. } => cmd::RMHOOK,
            ControlCommand::Name { .. } => cmd::NAME,
            ControlCommand::Shutdown => cmd::SHUTDOWN,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ControlCommand::Connect { .. } => "connect",
            ControlCommand::MkPeer { .. } => "mkpeer",
            ControlCommand::RmHook { .. } => "rmhook",
            ControlCommand::Name { .. } => "name",
            ControlCommand::Shutdown => "shutdown",
        }
    }

    fn args(&self) -> Result<serde_json::Value> {
        let value = match self {
            ControlCommand::Connect {
                our_hook,
                peer_path,
                peer_hook,
            } => serde_json::to_value(ConnectArgs {
                ourhook: our_hook.clone(),
                path: peer_path.clone(),
                peerhook: peer_hook.clone(),
            })?,
            ControlCommand::MkPeer {
                our_hook,
                peer_type,
                peer_hook,
            } => serde_json::to_value(MkPeerArgs {
                ourhook: our_hook.clone(),
                peer_type: peer_type.clone(),
                peerhook: peer_hook.clone(),
            })?,
            ControlCommand::RmHook { our_hook } => serde_json::to_value(RmHookArgs {
                ourhook: our_hook.clone(),
            })?,
            ControlCommand::Name { name } => {
                serde_json::to_value(NameArgs { name: name.clone() })?
            }
            ControlCommand::Shutdown => serde_json::Value::Null,
        };
        Ok(value)
    }

    fn from_parts(cookie: u32, code: u32, args: serde_json::Value) -> Result<Self> {
        if cookie != GENERIC_COOKIE {
            return Err(Error::engine("decode", EngineErrno::InvalidArgument));
        }
        let command = match code {
            cmd::CONNECT => {
                let a: ConnectArgs = serde_json::from_value(args)?;
                ControlCommand::Connect {
                    our_hook: a.ourhook,
                    peer_path: a.path,
                    peer_hook: a.peerhook,
                }
            }
            cmd::MKPEER => {
                let a: MkPeerArgs = serde_json::from_value(args)?;
                ControlCommand::MkPeer {
                    our_hook: a.ourhook,
                    peer_type: a.peer_type,
                    peer_hook: a.peerhook,
                }
            }
            cmd::RMHOOK => {
                let a: RmHookArgs = serde_json::from_value(args)?;
                ControlCommand::RmHook { our_hook: a.ourhook }
            }
            cmd::NAME => {
                let a: NameArgs = serde_json::from_value(args)?;
                ControlCommand::Name { name: a.name }
            }
            cmd::SHUTDOWN => ControlCommand::Shutdown,
            other => {
                return Err(Error::protocol(format!("unknown command code {}", other)));
            }
        };
        Ok(command)
    }
}

/// Control message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub path: NodePath,
    pub cookie: u32,
    pub cmd: u32,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ControlRequest {
    pub fn new(path: NodePath, command: &ControlCommand) -> Result<Self> {
        Ok(Self {
            path,
            cookie: GENERIC_COOKIE,
            cmd: command.code(),
            args: command.args()?,
        })
    }

    /// Decode the command-specific payload.
    pub fn command(&self) -> Result<ControlCommand> {
        ControlCommand::from_parts(self.cookie, self.cmd, self.args.clone())
    }
}

/// Free-form textual command, interpreted by the addressed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRequest {
    pub path: NodePath,
    pub text: String,
}

/// Engine verdict on a request, matched to it by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<EngineErrno>,
    #[serde(default)]
    pub result: i32,
}

impl StatusReply {
    pub fn ok(result: i32) -> Self {
        Self {
            errno: None,
            result,
        }
    }

    pub fn err(errno: EngineErrno) -> Self {
        Self {
            errno: Some(errno),
            result: -1,
        }
    }

    pub fn into_result(self, op: &str) -> Result<i32> {
        match self.errno {
            Some(errno) => Err(Error::engine(op, errno)),
            None => Ok(self.result),
        }
    }
}

/// Unsolicited administrative message from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMessage {
    /// Path of the node the message originates from.
    pub path: String,
    pub cookie: u32,
    pub cmd: u32,
    #[serde(default)]
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hook(s: &str) -> HookName {
        HookName::new(s).unwrap()
    }

    #[test]
    fn test_connect_payload_shape() {
        let command = ControlCommand::Connect {
            our_hook: hook("a"),
            peer_path: NodePath::new(".").unwrap(),
            peer_hook: hook("b"),
        };
        let request = ControlRequest::new(NodePath::new(".").unwrap(), &command).unwrap();
        assert_eq!(request.cookie, GENERIC_COOKIE);
        assert_eq!(request.cmd, cmd::CONNECT);
        assert_eq!(
            request.args,
            serde_json::json!({"ourhook": "a", "path": ".", "peerhook": "b"})
        );
        assert_eq!(request.command().unwrap(), command);
    }

    #[test]
    fn test_mkpeer_uses_type_key() {
        let command = ControlCommand::MkPeer {
            our_hook: hook("a"),
            peer_type: TypeName::new("hub").unwrap(),
            peer_hook: hook("a"),
        };
        let request = ControlRequest::new(NodePath::new(".").unwrap(), &command).unwrap();
        assert_eq!(request.args["type"], "hub");
    }

    #[test]
    fn test_foreign_cookie_rejected() {
        let request = ControlRequest {
            path: NodePath::new(".").unwrap(),
            cookie: 42,
            cmd: cmd::SHUTDOWN,
            args: serde_json::Value::Null,
        };
        let err = request.command().unwrap_err();
        assert_eq!(err.errno(), EngineErrno::InvalidArgument);
    }

    #[test]
    fn test_unknown_command_code() {
        let request = ControlRequest {
            path: NodePath::new(".").unwrap(),
            cookie: GENERIC_COOKIE,
            cmd: 99,
            args: serde_json::Value::Null,
        };
        assert!(request.command().unwrap_err().to_string().contains("unknown command code 99"));
    }

    #[test]
    fn test_status_into_result() {
        assert_eq!(StatusReply::ok(7).into_result("text").unwrap(), 7);
        let err = StatusReply::err(EngineErrno::AddressInUse)
            .into_result("name")
            .unwrap_err();
        assert_eq!(err.errno(), EngineErrno::AddressInUse);
        assert_eq!(
            serde_json::to_value(StatusReply::ok(0)).unwrap(),
            serde_json::json!({"result": 0})
        );
    }
}
