//! Explicit subscriber sets with capability-style unsubscription.
//!
//! Every notification source (an app-server client, a remote relay, the
//! mock driver) owns its own [`SubscriberSet`]. Registering a handler hands
//! back a [`Subscription`]; dropping it or calling
//! [`Subscription::unsubscribe`] removes the handler. There is no global
//! event bus.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Callback invoked for every event published to a set.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

type HandlerMap<T> = Mutex<BTreeMap<u64, Handler<T>>>;

struct Registry<T> {
    next_id: Mutex<u64>,
    handlers: HandlerMap<T>,
}

/// Ordered set of subscribers for one event source.
///
/// Handlers are invoked in registration order. `emit` snapshots the handler
/// list before calling out, so a handler may unsubscribe itself (or others)
/// without deadlocking.
pub struct SubscriberSet<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for SubscriberSet<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SubscriberSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> SubscriberSet<T> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: Mutex::new(0),
                handlers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.registry.handlers).len()
    }

    /// Whether the set has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber with `event`.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Handler<T>> = lock(&self.registry.handlers).values().cloned().collect();
        for handler in snapshot {
            handler(event);
        }
    }
}

impl<T: 'static> SubscriberSet<T> {
    /// Register `handler` and return its unsubscribe capability.
    pub fn subscribe(&self, handler: Handler<T>) -> Subscription {
        self.subscribe_with(handler, || {})
    }

    /// Register `handler`; `on_removed` runs after the handler has been
    /// removed and receives nothing, letting owners react to the set
    /// shrinking (for example stopping a stream when it empties).
    pub fn subscribe_with<F>(&self, handler: Handler<T>, on_removed: F) -> Subscription
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let id = {
            let mut next = lock(&self.registry.next_id);
            *next += 1;
            *next
        };
        lock(&self.registry.handlers).insert(id, handler);

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                lock(&registry.handlers).remove(&id);
            }
            on_removed();
        })
    }
}

/// Unsubscribe capability returned by every `subscribe` call.
///
/// Dropping the subscription unsubscribes. Call [`Subscription::detach`] to
/// keep the handler registered for the lifetime of the source.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Subscription {
    /// Wrap an arbitrary unsubscribe action.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the handler registered; the capability is discarded.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
