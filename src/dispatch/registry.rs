//! Data handler registry keyed by hook name.
//!
//! One handler per hook. Registering a hook again replaces the earlier
//! handler, so the most recent registration is the one that runs.

use std::collections::HashMap;
use std::fmt;

use crate::types::HookName;

/// Callback run for every data frame arriving on its hook.
///
/// Receives the payload and the context passed to `poll_once`.
pub type DataHandler<C> = Box<dyn FnMut(&[u8], &mut C) + Send>;

pub struct HandlerRegistry<C> {
    handlers: HashMap<HookName, DataHandler<C>>,
}

impl<C> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Install `handler` for `hook`, returning the handler it displaced.
    pub fn register(&mut self, hook: HookName, handler: DataHandler<C>) -> Option<DataHandler<C>> {
        let displaced = self.handlers.insert(hook.clone(), handler);
        if displaced.is_some() {
            tracing::debug!("Replaced data handler for hook {}", hook);
        }
        displaced
    }

    pub fn unregister(&mut self, hook: &str) -> Option<DataHandler<C>> {
        self.handlers.remove(hook)
    }

    /// Run the handler for `hook`. Returns false when none is registered.
    pub fn dispatch(&mut self, hook: &str, payload: &[u8], context: &mut C) -> bool {
        match self.handlers.get_mut(hook) {
            Some(handler) => {
                handler(payload, context);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, hook: &str) -> bool {
        self.handlers.contains_key(hook)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hooks: Vec<&str> = self.handlers.keys().map(HookName::as_str).collect();
        hooks.sort_unstable();
        f.debug_struct("HandlerRegistry").field("hooks", &hooks).finish()
    }
}
