//! In-process publish/subscribe keyed by event name.
//!
//! Each channel and each session owns its own bus; there is no global
//! instance. Handlers run synchronously on the emitting task, in
//! registration order. A panicking handler is logged and skipped so the
//! remaining handlers still see the event.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Token returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct EventBus<E> {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler<E>)>>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers)
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler. Returns `false` if it was not registered for `event`.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = lock(&self.handlers);
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Invoke every handler registered for `event`.
    ///
    /// The handler list is copied before dispatch, so handlers may
    /// subscribe or unsubscribe without deadlocking. Returns the number of
    /// handlers that completed without panicking.
    pub fn emit(&self, event: &str, payload: &E) -> usize {
        let targets: Vec<Handler<E>> = match lock(&self.handlers).get(event) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for handler in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => delivered += 1,
                Err(_) => log::error!("Handler for '{event}' panicked; continuing delivery"),
            }
        }
        delivered
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.handlers).get(event).map_or(0, Vec::len)
    }

    /// Drop every handler.
    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
