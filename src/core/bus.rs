//! Typed publish/subscribe event bus.
//!
//! Two kinds of listeners coexist:
//!
//! * **Inline consumers** are invoked synchronously while [`EventBus::publish`]
//!   runs, so their tables are updated before the publish call returns. The
//!   matcher and load balancer register this way; their handlers take only
//!   their own lock and never suspend.
//! * **Queued listeners** receive events through a bounded channel drained by
//!   a dedicated worker per listener. The bus stages events in arrival order;
//!   when the listener's queue is full only that listener's worker blocks,
//!   never the publisher.
//!
//! Events delivered to a single listener preserve the order `publish`
//! observed them. There is no cross-listener ordering guarantee.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::event::{Event, EventKind};

/// Minimum capacity a queued listener's channel must provide.
pub const MIN_LISTENER_CAPACITY: usize = 16;

/// Opaque handle of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors returned by listener registration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BusError {
    /// The bus has been shut down; no further listeners are accepted.
    #[error("event bus is closed")]
    Closed,

    /// The supplied channel is smaller than [`MIN_LISTENER_CAPACITY`].
    #[error("listener queue capacity {0} is below the minimum of {MIN_LISTENER_CAPACITY}")]
    CapacityTooSmall(usize),
}

/// A consumer applied synchronously during `publish`. Implementations must
/// not block and must not suspend; they may only take their own lock.
pub trait InlineConsumer: Send + Sync {
    fn on_event(&self, event: &Event);
}

#[derive(Clone)]
enum Sink {
    Inline(Arc<dyn InlineConsumer>),
    Queued(mpsc::UnboundedSender<Event>),
}

#[derive(Default)]
struct BusInner {
    closed: bool,
    by_kind: HashMap<EventKind, HashMap<ListenerId, Sink>>,
    staging: HashMap<ListenerId, mpsc::UnboundedSender<Event>>,
}

/// The in-process event broker gluing discovery to the request path.
#[derive(Default)]
pub struct EventBus {
    inner: RwLock<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queued listener for the given kinds. Registration is
    /// idempotent per `(listener, kind)` pair: repeated kinds collapse.
    ///
    /// The sink channel must have capacity of at least
    /// [`MIN_LISTENER_CAPACITY`]; when it fills up, only the worker feeding
    /// this listener blocks.
    pub fn add_listener(
        &self,
        sink: mpsc::Sender<Event>,
        kinds: &[EventKind],
    ) -> Result<ListenerId, BusError> {
        if sink.max_capacity() < MIN_LISTENER_CAPACITY {
            return Err(BusError::CapacityTooSmall(sink.max_capacity()));
        }

        let (staging_tx, mut staging_rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            while let Some(event) = staging_rx.recv().await {
                // A dropped receiver means the listener went away; the bus
                // entry is cleaned up lazily on the next remove_listener.
                if sink.send(event).await.is_err() {
                    break;
                }
            }
        });

        self.register(Sink::Queued(staging_tx.clone()), Some(staging_tx), kinds)
    }

    /// Register an inline consumer for the given kinds. The consumer runs
    /// synchronously inside `publish`, before it returns.
    pub fn add_inline(
        &self,
        consumer: Arc<dyn InlineConsumer>,
        kinds: &[EventKind],
    ) -> Result<ListenerId, BusError> {
        self.register(Sink::Inline(consumer), None, kinds)
    }

    fn register(
        &self,
        sink: Sink,
        staging: Option<mpsc::UnboundedSender<Event>>,
        kinds: &[EventKind],
    ) -> Result<ListenerId, BusError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(BusError::Closed);
        }

        let id = ListenerId::new();
        for kind in kinds {
            inner.by_kind.entry(*kind).or_default().insert(id, sink.clone());
        }
        if let Some(staging) = staging {
            inner.staging.insert(id, staging);
        }
        Ok(id)
    }

    /// Unregister a listener across all kinds. The listener's sink is not
    /// closed; a queued listener's worker drains what was already staged and
    /// exits.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for listeners in inner.by_kind.values_mut() {
            listeners.remove(&id);
        }
        inner.staging.remove(&id);
    }

    /// Deliver an event to every listener registered for its kind. Publishing
    /// after shutdown is silently dropped.
    pub fn publish(&self, event: Event) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        let Some(listeners) = inner.by_kind.get(&event.kind()) else {
            return;
        };

        for sink in listeners.values() {
            match sink {
                Sink::Inline(consumer) => consumer.on_event(&event),
                Sink::Queued(staging) => {
                    let _ = staging.send(event.clone());
                }
            }
        }
    }

    /// Shut the bus down. Further publishes are dropped, further
    /// registrations fail with [`BusError::Closed`]. Queued workers finish
    /// delivering what was already staged.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        inner.by_kind.clear();
        inner.staging.clear();
    }
}
