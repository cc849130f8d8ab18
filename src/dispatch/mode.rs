//! Error-handling mode and its scoped guard.

use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

use super::Dispatcher;

/// How transmit failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Any transmit failure aborts the running test.
    #[default]
    Strict,
    /// Failures are returned to the caller and recorded in `last_errno`.
    Tolerant,
}

/// Switches a dispatcher's error mode for the guard's lifetime.
///
/// The previous mode is restored on drop, including during unwinding.
pub struct ModeGuard<'a, C> {
    dispatcher: &'a mut Dispatcher<C>,
    previous: ErrorMode,
}

impl<'a, C> ModeGuard<'a, C> {
    pub(super) fn new(dispatcher: &'a mut Dispatcher<C>, mode: ErrorMode) -> Self {
        let previous = dispatcher.set_error_mode(mode);
        Self {
            dispatcher,
            previous,
        }
    }

    /// Mode that will be restored.
    pub fn previous(&self) -> ErrorMode {
        self.previous
    }
}

impl<C> Deref for ModeGuard<'_, C> {
    type Target = Dispatcher<C>;

    fn deref(&self) -> &Self::Target {
        self.dispatcher
    }
}

impl<C> DerefMut for ModeGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dispatcher
    }
}

impl<C> Drop for ModeGuard<'_, C> {
    fn drop(&mut self) {
        self.dispatcher.set_error_mode(self.previous);
    }
}

impl<C> std::fmt::Debug for ModeGuard<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeGuard")
            .field("mode", &self.dispatcher.error_mode())
            .field("previous", &self.previous)
            .finish()
    }
}
