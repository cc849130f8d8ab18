//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Failures
//! reported by the engine carry an [`EngineErrno`] classification that callers
//! inspect after a tolerant-mode transmit.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification reported by the engine (or inferred locally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineErrno {
    /// Hook or node already present.
    #[serde(rename = "EEXIST")]
    AlreadyExists,
    /// Name already held by another node.
    #[serde(rename = "EADDRINUSE")]
    AddressInUse,
    /// Path, node or hook could not be resolved.
    #[serde(rename = "ENOENT")]
    NotFound,
    /// Data sent on a hook with no peer.
    #[serde(rename = "ENOTCONN")]
    NotConnected,
    /// Delivery queue full.
    #[serde(rename = "ENOBUFS")]
    NoBufferSpace,
    #[serde(rename = "EINVAL")]
    InvalidArgument,
    /// Unknown node type.
    #[serde(rename = "ENXIO")]
    NoSuchType,
    /// No reply within the configured reply timeout.
    #[serde(rename = "ETIMEDOUT")]
    TimedOut,
    #[serde(rename = "EMSGSIZE")]
    MessageTooLong,
    /// Local socket failure.
    #[serde(rename = "EIO")]
    Io,
}

impl EngineErrno {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineErrno::AlreadyExists => "EEXIST",
            EngineErrno::AddressInUse => "EADDRINUSE",
            EngineErrno::NotFound => "ENOENT",
            EngineErrno::NotConnected => "ENOTCONN",
            EngineErrno::NoBufferSpace => "ENOBUFS",
            EngineErrno::InvalidArgument => "EINVAL",
            EngineErrno::NoSuchType => "ENXIO",
            EngineErrno::TimedOut => "ETIMEDOUT",
            EngineErrno::MessageTooLong => "EMSGSIZE",
            EngineErrno::Io => "EIO",
        }
    }
}

impl fmt::Display for EngineErrno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error enum for ngsock.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid caller input (bad names, oversized names).
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation refused by the engine.
    #[error("{op} failed: {errno}")]
    Engine { op: String, errno: EngineErrno },

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Reading from the engine failed or produced a frame that makes no
    /// sense. Never tolerated, whatever the error mode.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Channels not open, or the peer went away.
    #[error("channel closed: {0}")]
    Closed(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classification recorded as the dispatcher's last error.
    pub fn errno(&self) -> EngineErrno {
        match self {
            Error::Engine { errno, .. } => *errno,
            Error::Validation(_) | Error::Protocol(_) | Error::Serialization(_) => {
                EngineErrno::InvalidArgument
            }
            Error::Timeout(_) => EngineErrno::TimedOut,
            Error::Receive(_) => EngineErrno::Io,
            Error::Closed(_) => EngineErrno::NotConnected,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock => EngineErrno::NoBufferSpace,
                std::io::ErrorKind::NotFound => EngineErrno::NotFound,
                std::io::ErrorKind::NotConnected | std::io::ErrorKind::ConnectionRefused => {
                    EngineErrno::NotConnected
                }
                _ => EngineErrno::Io,
            },
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn engine(op: impl Into<String>, errno: EngineErrno) -> Self {
        Self::Engine {
            op: op.into(),
            errno,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Reclassify an error hit while reading from the engine.
    pub fn receive(err: impl fmt::Display) -> Self {
        Self::Receive(err.to_string())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }
}
