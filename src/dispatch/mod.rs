//! Two-channel event dispatcher.
//!
//! The dispatcher owns the control and data channels plus a registry of data
//! handlers. Callers script control messages and data sends, then pump the
//! event loop with [`Dispatcher::drain_events`] before asserting on whatever
//! their handlers accumulated in the context.
//!
//! Failure policy:
//! - transmit failures go through the error-mode gate: strict mode aborts the
//!   test with a diagnostic, tolerant mode returns the error and records its
//!   classification in [`Dispatcher::last_errno`];
//! - channel open and receive failures always abort, including a bad reply
//!   read while a transmit waits for its status.

mod mode;
mod registry;

pub use mode::{ErrorMode, ModeGuard};
pub use registry::{DataHandler, HandlerRegistry};

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::channel::Channels;
use crate::types::{Config, EngineErrno, Error, HookName, NodeName, NodePath, Result, TypeName};
use crate::wire::{ControlCommand, EngineMessage};

/// What a single [`Dispatcher::poll_once`] call processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollOutcome {
    /// An engine message was received (and discarded).
    pub control: bool,
    /// A data frame was received.
    pub data: bool,
}

impl PollOutcome {
    /// True when the wait ended without anything to process.
    pub fn timed_out(&self) -> bool {
        !self.processed()
    }

    pub fn processed(&self) -> bool {
        self.control || self.data
    }
}

/// Event dispatcher over one control and one data channel.
///
/// `C` is the context type handed to data handlers on every dispatch.
pub struct Dispatcher<C = ()> {
    config: Config,
    channels: Option<Channels>,
    registry: HandlerRegistry<C>,
    mode: ErrorMode,
    last_errno: Option<EngineErrno>,
}

impl<C> Dispatcher<C> {
    /// Dispatcher with closed channels; [`init`](Self::init) opens them.
    pub fn new(config: Config) -> Self {
        let mode = config.dispatch.initial_mode;
        Self {
            config,
            channels: None,
            registry: HandlerRegistry::new(),
            mode,
            last_errno: None,
        }
    }

    /// Dispatcher adopting channels that are already open.
    pub fn with_channels(config: Config, channels: Channels) -> Self {
        let mut dispatcher = Self::new(config);
        dispatcher.channels = Some(channels);
        dispatcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.channels.is_some()
    }

    /// Open both channels unless already open. Aborts on failure.
    pub async fn init(&mut self) {
        if let Err(err) = self.try_init().await {
            fatal("init", &err);
        }
    }

    /// Open both channels unless already open.
    pub async fn try_init(&mut self) -> Result<()> {
        if self.channels.is_some() {
            return Ok(());
        }
        let mut channels = Channels::open(&self.config.channel)?;
        channels.hello(self.config.dispatch.reply_timeout).await?;
        self.channels = Some(channels);
        Ok(())
    }

    // =========================================================================
    // Error mode
    // =========================================================================

    pub fn error_mode(&self) -> ErrorMode {
        self.mode
    }

    /// Swap the error mode, returning the one in effect before.
    pub fn set_error_mode(&mut self, mode: ErrorMode) -> ErrorMode {
        std::mem::replace(&mut self.mode, mode)
    }

    /// Use `mode` until the returned guard is dropped.
    pub fn scoped_mode(&mut self, mode: ErrorMode) -> ModeGuard<'_, C> {
        ModeGuard::new(self, mode)
    }

    /// Tolerate transmit failures until the returned guard is dropped.
    pub fn tolerant(&mut self) -> ModeGuard<'_, C> {
        self.scoped_mode(ErrorMode::Tolerant)
    }

    /// Classification of the most recent transmit failure; cleared by the
    /// next successful transmit.
    pub fn last_errno(&self) -> Option<EngineErrno> {
        self.last_errno
    }

    // =========================================================================
    // Handler registry
    // =========================================================================

    /// Run `handler` for every data frame arriving on `hook`.
    ///
    /// Replaces (and returns) any handler already registered for the hook.
    pub fn register_data_handler<F>(&mut self, hook: HookName, handler: F) -> Option<DataHandler<C>>
    where
        F: FnMut(&[u8], &mut C) + Send + 'static,
    {
        self.registry.register(hook, Box::new(handler))
    }

    pub fn unregister_data_handler(&mut self, hook: &str) -> Option<DataHandler<C>> {
        self.registry.unregister(hook)
    }

    pub fn handler_count(&self) -> usize {
        self.registry.len()
    }

    // =========================================================================
    // Transmit
    // =========================================================================

    /// Send a control message to the node at `path`.
    pub async fn send_control(&mut self, path: &str, command: ControlCommand) -> Result<()> {
        let op = command.label();
        let result = self.try_send_control(path, &command).await;
        self.gate(op, result)
    }

    async fn try_send_control(&mut self, path: &str, command: &ControlCommand) -> Result<()> {
        let path = NodePath::new(path)?;
        let reply_timeout = self.config.dispatch.reply_timeout;
        let channels = self.channels_mut()?;
        tracing::debug!("Sending {} to {}", command.label(), path);
        channels
            .send_control(path, command, reply_timeout)
            .await?
            .into_result(command.label())?;
        Ok(())
    }

    /// Connect `our_hook` on `path` to `peer_hook` on `peer_path`.
    pub async fn connect(
        &mut self,
        path: &str,
        our_hook: &str,
        peer_path: &str,
        peer_hook: &str,
    ) -> Result<()> {
        let command = build("connect", || {
            Ok(ControlCommand::Connect {
                our_hook: HookName::new(our_hook)?,
                peer_path: NodePath::new(peer_path)?,
                peer_hook: HookName::new(peer_hook)?,
            })
        });
        self.send_built(path, command).await
    }

    /// Create a `peer_type` node attached to `path` via `our_hook` ↔ `peer_hook`.
    pub async fn mkpeer(
        &mut self,
        path: &str,
        our_hook: &str,
        peer_type: &str,
        peer_hook: &str,
    ) -> Result<()> {
        let command = build("mkpeer", || {
            Ok(ControlCommand::MkPeer {
                our_hook: HookName::new(our_hook)?,
                peer_type: TypeName::new(peer_type)?,
                peer_hook: HookName::new(peer_hook)?,
            })
        });
        self.send_built(path, command).await
    }

    pub async fn rmhook(&mut self, path: &str, our_hook: &str) -> Result<()> {
        let command = build("rmhook", || {
            Ok(ControlCommand::RmHook {
                our_hook: HookName::new(our_hook)?,
            })
        });
        self.send_built(path, command).await
    }

    /// Give the node at `path` the global name `name`.
    pub async fn name(&mut self, path: &str, name: &str) -> Result<()> {
        let command = build("name", || {
            Ok(ControlCommand::Name {
                name: NodeName::new(name)?,
            })
        });
        self.send_built(path, command).await
    }

    pub async fn shutdown(&mut self, path: &str) -> Result<()> {
        self.send_control(path, ControlCommand::Shutdown).await
    }

    async fn send_built(
        &mut self,
        path: &str,
        command: std::result::Result<ControlCommand, (&'static str, Error)>,
    ) -> Result<()> {
        match command {
            Ok(command) => self.send_control(path, command).await,
            Err((op, err)) => self.gate(op, Err(err)),
        }
    }

    /// Send a text command to the node at `path`; returns the engine's
    /// numeric result.
    pub async fn send_text_message(&mut self, path: &str, text: &str) -> Result<i32> {
        let result = self.try_send_text(path, text).await;
        self.gate("send_text_message", result)
    }

    async fn try_send_text(&mut self, path: &str, text: &str) -> Result<i32> {
        let path = NodePath::new(path)?;
        let reply_timeout = self.config.dispatch.reply_timeout;
        let channels = self.channels_mut()?;
        tracing::debug!("Sending text {:?} to {}", text, path);
        channels
            .send_text(path, text, reply_timeout)
            .await?
            .into_result("send_text_message")
    }

    /// Send `payload` out of our hook `hook`. Delivery is not acknowledged.
    pub async fn send_data(&mut self, hook: &str, payload: &[u8]) -> Result<()> {
        let result = self.try_send_data(hook, payload).await;
        self.gate("send_data", result)
    }

    async fn try_send_data(&mut self, hook: &str, payload: &[u8]) -> Result<()> {
        let hook = HookName::new(hook)?;
        let reply_timeout = self.config.dispatch.reply_timeout;
        let channels = self.channels_mut()?;
        channels
            .send_data(&hook, payload, reply_timeout)
            .await?
            .into_result("send_data")?;
        Ok(())
    }

    fn channels_mut(&mut self) -> Result<&mut Channels> {
        self.channels
            .as_mut()
            .ok_or_else(|| Error::closed("dispatcher channels are not open"))
    }

    fn gate<T>(&mut self, op: &str, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.last_errno = None;
                Ok(value)
            }
            Err(err) => {
                self.last_errno = Some(err.errno());
                if matches!(err, Error::Receive(_)) {
                    fatal(op, &err);
                }
                match self.mode {
                    ErrorMode::Strict => fatal(op, &err),
                    ErrorMode::Tolerant => {
                        tracing::debug!("{} failed (tolerated): {}", op, err);
                        Err(err)
                    }
                }
            }
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Wait up to `timeout` for either channel and process what is ready.
    ///
    /// Handles at most one engine message and one data frame. A wake-up with
    /// nothing to receive keeps waiting against the original deadline, so the
    /// call never blocks longer than `timeout` in total.
    pub async fn poll_once(&mut self, timeout: Duration, context: &mut C) -> PollOutcome {
        match self.try_poll_once(timeout, context).await {
            Ok(outcome) => outcome,
            Err(err) => fatal("poll_once", &err),
        }
    }

    async fn try_poll_once(&mut self, timeout: Duration, context: &mut C) -> Result<PollOutcome> {
        let deadline = Instant::now() + timeout;
        let Self {
            channels, registry, ..
        } = self;
        let channels = channels
            .as_mut()
            .ok_or_else(|| Error::closed("dispatcher channels are not open"))?;

        loop {
            match tokio::time::timeout_at(deadline, channels.readable()).await {
                Err(_elapsed) => return Ok(PollOutcome::default()),
                Ok(ready) => ready?,
            }

            let mut outcome = PollOutcome::default();
            if let Some(message) = channels.try_recv_message()? {
                handle_message(&message);
                outcome.control = true;
            }
            if let Some((hook, payload)) = channels.try_recv_data()? {
                if !registry.dispatch(hook.as_str(), &payload, context) {
                    tracing::debug!("No handler for {} bytes on hook {}", payload.len(), hook);
                }
                outcome.data = true;
            }
            if outcome.processed() {
                return Ok(outcome);
            }
            tracing::trace!("Spurious wake-up, waiting out the remaining budget");
        }
    }

    /// Call [`poll_once`](Self::poll_once) until a wait times out. Returns the
    /// number of polls that processed something.
    pub async fn drain_events(&mut self, timeout: Duration, context: &mut C) -> usize {
        let mut processed = 0;
        while self.poll_once(timeout, context).await.processed() {
            processed += 1;
        }
        processed
    }

    /// [`drain_events`](Self::drain_events) with the configured default poll
    /// timeout.
    pub async fn drain(&mut self, context: &mut C) -> usize {
        let timeout = self.config.dispatch.default_poll_timeout;
        self.drain_events(timeout, context).await
    }
}

fn handle_message(message: &EngineMessage) {
    tracing::info!(
        cookie = message.cookie,
        cmd = message.cmd,
        "Got message from {}",
        message.path
    );
}

fn build<F>(op: &'static str, f: F) -> std::result::Result<ControlCommand, (&'static str, Error)>
where
    F: FnOnce() -> Result<ControlCommand>,
{
    f().map_err(|err| (op, err))
}

/// Abort the running test with a diagnostic.
#[allow(clippy::panic)]
fn fatal(op: &str, err: &Error) -> ! {
    tracing::error!("{} failed: {}", op, err);
    panic!("ngsock: {} failed: {}", op, err);
}

impl<C> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("channels", &self.channels)
            .field("registry", &self.registry)
            .field("mode", &self.mode)
            .field("last_errno", &self.last_errno)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback;
    use tracing_test::traced_test;

    const POLL: Duration = Duration::from_millis(50);

    async fn dispatcher() -> Dispatcher<usize> {
        let config = Config::default();
        let (channels, _engine) = loopback::spawn(&config.channel).unwrap();
        Dispatcher::with_channels(config, channels)
    }

    fn hook(s: &str) -> HookName {
        HookName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_set_error_mode_returns_previous() {
        let mut ng = dispatcher().await;
        assert_eq!(ng.set_error_mode(ErrorMode::Tolerant), ErrorMode::Strict);
        assert_eq!(ng.set_error_mode(ErrorMode::Strict), ErrorMode::Tolerant);
    }

    #[tokio::test]
    async fn test_mode_guard_restores() {
        let mut ng = dispatcher().await;
        {
            let mut guard = ng.tolerant();
            assert_eq!(guard.previous(), ErrorMode::Strict);
            assert_eq!(guard.error_mode(), ErrorMode::Tolerant);
            assert!(guard.shutdown("nowhere:").await.is_err());
        }
        assert_eq!(ng.error_mode(), ErrorMode::Strict);
        assert_eq!(ng.last_errno(), Some(EngineErrno::NotFound));
    }

    #[tokio::test]
    async fn test_init_is_noop_when_open() {
        let mut ng = dispatcher().await;
        ng.init().await;
        assert!(ng.is_open());
        ng.connect(".", "a", ".", "b").await.unwrap();
    }

    #[tokio::test]
    async fn test_transmit_before_init_is_tolerable() {
        let mut config = Config::default();
        config.dispatch.initial_mode = ErrorMode::Tolerant;
        let mut ng: Dispatcher<()> = Dispatcher::new(config);
        let err = ng.send_data("a", b"x").await.unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        assert_eq!(ng.last_errno(), Some(EngineErrno::NotConnected));
    }

    #[tokio::test]
    async fn test_invalid_names_are_gated() {
        let mut ng = dispatcher().await;
        let mut ng = ng.tolerant();
        let err = ng
            .connect(".", &"h".repeat(40), ".", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(ng.last_errno(), Some(EngineErrno::InvalidArgument));
    }

    #[tokio::test]
    async fn test_last_errno_cleared_by_success() {
        let mut ng = dispatcher().await;
        let mut ng = ng.tolerant();
        assert!(ng.send_data("a", b"x").await.is_err());
        assert_eq!(ng.last_errno(), Some(EngineErrno::NotConnected));
        ng.connect(".", "a", ".", "b").await.unwrap();
        assert_eq!(ng.last_errno(), None);
    }

    #[tokio::test]
    async fn test_unhandled_frame_still_counts_as_event() {
        let mut ng = dispatcher().await;
        ng.connect(".", "a", ".", "b").await.unwrap();
        ng.send_data("a", b"test\0").await.unwrap();

        let mut received = 0;
        let outcome = ng.poll_once(POLL, &mut received).await;
        assert!(outcome.data);
        assert_eq!(received, 0);
        assert!(ng.poll_once(POLL, &mut received).await.timed_out());
    }

    #[tokio::test]
    async fn test_handler_receives_payload() {
        let mut ng: Dispatcher<Vec<u8>> = {
            let config = Config::default();
            let (channels, _engine) = loopback::spawn(&config.channel).unwrap();
            Dispatcher::with_channels(config, channels)
        };
        ng.connect(".", "a", ".", "b").await.unwrap();
        ng.register_data_handler(hook("b"), |payload, seen: &mut Vec<u8>| {
            seen.extend_from_slice(payload)
        });
        ng.send_data("a", b"test\0").await.unwrap();

        let mut seen = Vec::new();
        assert_eq!(ng.drain_events(POLL, &mut seen).await, 1);
        assert_eq!(seen, b"test\0");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_engine_message_is_logged_and_discarded() {
        let mut ng = dispatcher().await;
        ng.mkpeer(".", "a", "hub", "a").await.unwrap();
        ng.name("a", "test hub").await.unwrap();
        ng.send_text_message("test hub:", "setpersistent")
            .await
            .unwrap();

        let mut received = 0;
        let outcome = ng.poll_once(POLL, &mut received).await;
        assert!(outcome.control);
        assert!(!outcome.data);
        assert_eq!(received, 0);
        assert!(logs_contain("Got message from"));
    }
}
