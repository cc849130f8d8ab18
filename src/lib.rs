//! # ngsock - Control/Data Socket Dispatcher
//!
//! Conformance harness for graph-based networking engines reached through a
//! pair of userspace sockets:
//! - Control channel for administrative messages (connect, mkpeer, name,
//!   rmhook, shutdown, text commands)
//! - Data channel for payload frames tagged with a hook name
//! - Readiness-multiplexed event loop dispatching frames to per-hook handlers
//! - Strict/tolerant error modes for scripting expected failures
//! - Loopback reference engine for running without the real engine
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────── Dispatcher ────────────────┐
//!   test body  →  │  send_control / send_text / send_data      │
//!                 │          │ error-mode gate                 │
//!                 │  ┌───────▼──────┐      ┌─────────────────┐ │
//!                 │  │   Channels   │─────▶│ HandlerRegistry │ │
//!                 │  │ control/data │      │  hook → handler │ │
//!                 │  └───────┬──────┘      └─────────────────┘ │
//!                 └──────────┼─────────────────────────────────┘
//!                            │ wire frames (Unix datagrams)
//!                     ┌──────▼──────┐
//!                     │   engine    │  (external, or loopback)
//!                     └─────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod channel;
pub mod dispatch;
pub mod loopback;
pub mod types;
pub mod wire;

// Internal utilities
pub mod observability;

pub use channel::Channels;
pub use dispatch::{DataHandler, Dispatcher, ErrorMode, ModeGuard, PollOutcome};
pub use types::{Config, EngineErrno, Error, HookName, NodeName, NodePath, Result, TypeName};
pub use wire::ControlCommand;
