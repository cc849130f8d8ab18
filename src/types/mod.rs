//! Core types for ngsock.
//!
//! This module provides foundational types used throughout the crate:
//! - **Names**: Length-bounded hook, node, type and path names
//! - **Errors**: Error types with thiserror derives and engine errno classes
//! - **Config**: Channel, dispatcher and observability configuration

mod config;
mod errors;
mod names;

pub use config::{ChannelConfig, Config, DispatchConfig, ObservabilityConfig};
pub use errors::{EngineErrno, Error, Result};
pub use names::{HookName, NodeName, NodePath, TypeName, HOOK_SIZE, NODE_SIZE, PATH_SIZE, TYPE_SIZE};
