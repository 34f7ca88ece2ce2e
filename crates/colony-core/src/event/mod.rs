//! In-process typed publish/subscribe for lifecycle events.
//!
//! Delivery is best-effort in-memory with no persistence; consumers needing
//! durability persist themselves. Services publish strictly after their
//! transaction commits, so no event is ever observed for rolled-back work.

mod types;

pub use types::{Event, EventType, EventTypeParseError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

/// A subscriber callback.
///
/// Handlers must be non-blocking; long work belongs on a task the handler
/// spawns itself. A handler returning `Err` is logged and never prevents
/// later handlers from seeing the event.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    event_type: EventType,
    id: u64,
}

struct Subscriber {
    id: u64,
    handler: EventHandler,
}

/// In-process event bus.
///
/// Synchronous handlers are invoked in registration order on the publisher's
/// thread; async consumers tap the broadcast channel via [`EventBus::watch`].
pub struct EventBus {
    subscribers: Mutex<HashMap<EventType, Vec<Subscriber>>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<Event>,
}

impl EventBus {
    /// Broadcast buffer size for async taps; slow consumers observe `Lagged`.
    const BROADCAST_CAPACITY: usize = 256;

    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(Self::BROADCAST_CAPACITY);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            broadcast,
        }
    }

    /// Register a handler for one event type. Handlers for the same type are
    /// invoked in registration order.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.entry(event_type).or_default().push(Subscriber {
            id,
            handler: Arc::new(handler),
        });
        SubscriptionHandle { event_type, id }
    }

    /// Remove a previously registered handler. Unknown handles are a no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        if let Some(list) = subscribers.get_mut(&handle.event_type) {
            list.retain(|s| s.id != handle.id);
        }
    }

    /// Deliver an event to all handlers registered for its type.
    ///
    /// Handler failures are logged and swallowed so one failing subscriber
    /// cannot starve the rest.
    pub fn publish(&self, event: Event) {
        // Snapshot the handler list so a handler can subscribe/unsubscribe
        // without deadlocking against the publisher.
        let handlers: Vec<EventHandler> = {
            let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
            subscribers
                .get(&event.event_type)
                .map(|list| list.iter().map(|s| Arc::clone(&s.handler)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            if let Err(e) = handler(&event) {
                tracing::warn!(
                    event_type = %event.event_type,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "event handler failed"
                );
            }
        }

        // Fan out to async taps; no receivers is fine.
        let _ = self.broadcast.send(event);
    }

    /// Tap the bus as an async stream of every published event.
    pub fn watch(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Number of handlers registered for an event type.
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.get(&event_type).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("event_types", &subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}
