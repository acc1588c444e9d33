//! Explicitly scoped event subscriptions.
//!
//! An [`EventRegistry`] is created by whoever owns a transport and handed to
//! the components that need to listen on it. Each [`EventRegistry::subscribe`]
//! returns a [`Subscription`] guard; dropping the guard removes the handler.
//! [`EventRegistry::clear`] tears down every subscription at once.

use crate::group::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Called with the sending peer and the raw payload.
pub type EventHandler = Arc<dyn Fn(PeerId, &[u8]) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
}

/// Clonable handle; every clone sees the same subscriptions.
#[derive(Clone, Default)]
pub struct EventRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(state: &Mutex<RegistryState>) -> std::sync::MutexGuard<'_, RegistryState> {
        state.lock().expect("event registry lock poisoned")
    }

    /// Register `handler` for `event` until the returned guard is dropped.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(PeerId, &[u8]) + Send + Sync + 'static,
    {
        let event = event.into();
        let mut state = Self::lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state
            .handlers
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            state: Arc::downgrade(&self.state),
            event,
            id,
        }
    }

    /// Deliver `payload` to every handler of `event`.
    ///
    /// Handlers run on the caller's task, outside the registry lock, in
    /// subscription order. Returns how many handlers ran.
    pub fn emit(&self, event: &str, source: PeerId, payload: &[u8]) -> usize {
        let handlers: Vec<EventHandler> = match Self::lock(&self.state).handlers.get(event) {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(source, payload);
        }
        handlers.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        Self::lock(&self.state)
            .handlers
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Remove every handler for every event.
    pub fn clear(&self) {
        Self::lock(&self.state).handlers.clear();
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = Self::lock(&self.state);
        let mut events: Vec<_> = state
            .handlers
            .iter()
            .map(|(event, list)| (event.clone(), list.len()))
            .collect();
        events.sort();
        f.debug_struct("EventRegistry").field("events", &events).finish()
    }
}

/// Keeps one handler registered. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    state: Weak<Mutex<RegistryState>>,
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = EventRegistry::lock(&state);
        if let Some(list) = state.handlers.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                state.handlers.remove(&self.event);
            }
        }
    }
}
