//! Event delivery primitives for browser sessions.
//!
//! Two shapes are offered. [`ListenerSet`] is the synchronous fan-out used for the
//! network event stream: every registered handler runs once per event, on the
//! dispatching task, in delivery order, so nothing is buffered and nothing can lag.
//! [`InMemoryBus`] is the broadcast flavour for low-volume signals (page lifecycle)
//! where waiters subscribe before triggering the thing they wait for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscriber is listening")]
    NoSubscribers,
    #[error("listener {0:?} is not registered")]
    UnknownListener(ListenerId),
}

#[async_trait]
pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError>;
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// Simple in-memory bus suitable for unit tests and lifecycle signalling.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }
}

#[async_trait]
impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers)
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

/// Handle returned by [`ListenerSet::listen`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(pub u64);

/// Callback invoked once per dispatched event. Must not block on I/O.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of synchronous handlers.
pub struct ListenerSet<E> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(ListenerId, Handler<E>)>>,
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> ListenerSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, handler: Handler<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub fn remove(&self, id: ListenerId) -> Result<(), BusError> {
        let mut guard = self.handlers.write();
        let before = guard.len();
        guard.retain(|(existing, _)| *existing != id);
        if guard.len() == before {
            return Err(BusError::UnknownListener(id));
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Invoke every handler with `event`, in registration order.
    ///
    /// The handler list is cloned before invocation so a handler may register or
    /// remove listeners without deadlocking.
    pub fn dispatch(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        trace!(target: "event-bus", listeners = handlers.len(), "dispatching event");
        for handler in handlers {
            handler(event);
        }
    }
}
