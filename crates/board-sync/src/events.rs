//! Event infrastructure for board-sync.
//!
//! Provides two publish/subscribe primitives:
//! - `EventBus<P>`: topic-keyed hub, each delivery wrapped in an `Envelope`
//! - `Emitter<E>`: untopiced listener list used by each component for its own events
//!
//! Both hand out a `Subscription` that unsubscribes automatically when dropped.
//! Callbacks run synchronously in registration order. A panicking callback is
//! caught and logged so the remaining subscribers still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::error;

use crate::clock::SharedClock;

/// Topic carrying every `SyncEvent` emitted by the structure manager.
pub const SYNC_TOPIC: &str = "sync";

/// Topic carrying the structure captured by a forced sync.
pub const SYNC_FILESYSTEM_TOPIC: &str = "sync-filesystem";

/// Anything that can drop a registration by id.
trait Registry: Send + Sync {
    fn remove(&self, topic: Option<&str>, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    registry: Weak<dyn Registry>,
    topic: Option<String>,
    id: usize,
}

impl Subscription {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.topic.as_deref(), self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

/// A published payload together with its routing data.
#[derive(Debug, Clone)]
pub struct Envelope<P> {
    pub topic: String,
    pub payload: P,
    /// Publish time in milliseconds since Unix epoch.
    pub timestamp: u64,
}

type EnvelopeCallback<P> = Arc<dyn Fn(&Envelope<P>) + Send + Sync>;

/// Topic-keyed publish/subscribe hub.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<P> {
    clock: SharedClock,
    topics: RwLock<HashMap<String, Vec<(usize, EnvelopeCallback<P>)>>>,
    next_id: AtomicUsize,
}

impl<P: Send + Sync + 'static> EventBus<P> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Register `callback` under `topic`. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        callback: impl Fn(&Envelope<P>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        let registry: Weak<dyn Registry> = Arc::downgrade(self) as Weak<dyn Registry>;
        Subscription {
            registry,
            topic: Some(topic.to_string()),
            id,
        }
    }

    /// Remove a registration. No-op if it is not present.
    pub fn unsubscribe(&self, topic: &str, id: usize) {
        // try_write: Drop may run during panic unwinding while a read lock is held.
        if let Ok(mut topics) = self.topics.try_write() {
            if let Some(callbacks) = topics.get_mut(topic) {
                callbacks.retain(|(i, _)| *i != id);
                if callbacks.is_empty() {
                    topics.remove(topic);
                }
            }
        }
    }

    /// Deliver `payload` to every callback currently registered for `topic`.
    pub fn publish(&self, topic: &str, payload: P) {
        // Clone the callback list so a callback may subscribe or unsubscribe.
        let callbacks: Vec<_> = self
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            return;
        }

        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
            timestamp: self.clock.now_ms(),
        };

        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&envelope))).is_err() {
                error!("Subscriber on topic '{}' panicked, continuing", topic);
            }
        }
    }

    /// Number of callbacks registered under `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, Vec::len)
    }
}

impl<P: Send + Sync + 'static> Registry for EventBus<P> {
    fn remove(&self, topic: Option<&str>, id: usize) {
        if let Some(topic) = topic {
            self.unsubscribe(topic, id);
        }
    }
}

type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Listener list for a single component's events.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct Emitter<E> {
    callbacks: RwLock<Vec<(usize, EventCallback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let registry: Weak<dyn Registry> = Arc::downgrade(self) as Weak<dyn Registry>;
        Subscription {
            registry,
            topic: None,
            id,
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Event listener panicked, continuing");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Registry for Emitter<E> {
    fn remove(&self, _topic: Option<&str>, id: usize) {
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }
}
