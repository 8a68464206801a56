//! Event handler registry
//!
//! Handlers are keyed by event name and compared by pointer identity, so the
//! same `Arc` registered twice is stored once.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked with the event payload
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Wrap a closure as an [`EventHandler`]
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_handler(a: &EventHandler, b: &EventHandler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// `event name -> handlers`, insertion ordered within an event
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if this handler was already registered for the event
    pub fn add(&mut self, event: &str, handler: EventHandler) -> bool {
        let entry = self.handlers.entry(event.to_string()).or_default();
        if entry.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        entry.push(handler);
        true
    }

    /// Returns false if the handler was not registered; empty events are pruned
    pub fn remove(&mut self, event: &str, handler: &EventHandler) -> bool {
        let Some(entry) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|h| !same_handler(h, handler));
        let removed = entry.len() != before;
        if entry.is_empty() {
            self.handlers.remove(event);
        }
        removed
    }

    pub fn handlers_for(&self, event: &str) -> Vec<EventHandler> {
        self.handlers.get(event).cloned().unwrap_or_default()
    }

    pub fn contains_event(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    pub fn event_count(&self) -> usize {
        self.handlers.len()
    }

    /// Total number of registrations across all events
    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(event, handlers)| (event.as_str(), handlers.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

/// Returned by `ConnectionManager::on`; `unsubscribe` may be called any number of times
///
/// Dropping the subscription does not unregister the handler.
pub struct HandlerSubscription {
    active: AtomicBool,
    unsubscribe: Box<dyn Fn() + Send + Sync>,
}

impl HandlerSubscription {
    pub(crate) fn new(unsubscribe: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            active: AtomicBool::new(true),
            unsubscribe: Box::new(unsubscribe),
        }
    }

    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            (self.unsubscribe)();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for HandlerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}
