//! In-memory connection for development and tests
//!
//! Keeps listeners, rooms and an outbox in process. Inbound events are
//! injected with [`LocalConnection::deliver`] or [`LocalConnection::fire`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::application::errors::{ConnectionError, SocketError};
use crate::domain::traits::{AckCallback, Connection, Emitter, ListenerFuture, Payload, RawListener, Room};

/// Delivery flags of an outgoing message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub broadcast: bool,
    pub volatile: bool,
    pub compress: bool,
}

/// Message emitted through a local connection or one of its emitters
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub event: String,
    pub payload: Payload,
    pub delivery: Delivery,
    pub wants_ack: bool,
}

struct Inner {
    id: String,
    listeners: Mutex<Vec<(String, RawListener)>>,
    rooms: Mutex<BTreeSet<Room>>,
    outbox: Mutex<Vec<Outgoing>>,
    connected: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn send(&self, event: &str, payload: Payload, ack: Option<AckCallback>, delivery: Delivery) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        lock(&self.outbox).push(Outgoing {
            event: event.to_string(),
            payload,
            delivery,
            wants_ack: ack.is_some(),
        });
        Ok(())
    }
}

/// Cloneable handle to one in-memory connection
#[derive(Clone)]
pub struct LocalConnection {
    inner: Arc<Inner>,
}

impl LocalConnection {
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Create a connection with a fixed id. It starts in the room named after its id.
    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut rooms = BTreeSet::new();
        rooms.insert(id.clone());
        Self {
            inner: Arc::new(Inner {
                id,
                listeners: Mutex::new(Vec::new()),
                rooms: Mutex::new(rooms),
                outbox: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Invoke every listener for `event` in attach order without awaiting them
    pub fn fire(&self, event: &str, data: Payload, ack: Option<AckCallback>) -> Vec<ListenerFuture> {
        let listeners: Vec<RawListener> = lock(&self.inner.listeners)
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        tracing::trace!("[{}] {} listener(s) for '{}'", self.inner.id, listeners.len(), event);

        listeners
            .into_iter()
            .map(|listener| listener(data.clone(), ack.clone()))
            .collect()
    }

    /// Invoke every listener for `event` and await each one in turn
    pub async fn deliver(&self, event: &str, data: Payload, ack: Option<AckCallback>) -> Vec<Result<(), SocketError>> {
        let mut results = Vec::new();
        for pending in self.fire(event, data, ack) {
            results.push(pending.await);
        }
        results
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    pub fn listener_count_for(&self, event: &str) -> usize {
        lock(&self.inner.listeners)
            .iter()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// Distinct event names with at least one listener
    pub fn events(&self) -> Vec<String> {
        let listeners = lock(&self.inner.listeners);
        let mut events: Vec<String> = Vec::new();
        for (name, _) in listeners.iter() {
            if !events.contains(name) {
                events.push(name.clone());
            }
        }
        events
    }

    pub fn outbox(&self) -> Vec<Outgoing> {
        lock(&self.inner.outbox).clone()
    }

    /// Drain and return everything emitted so far
    pub fn take_outbox(&self) -> Vec<Outgoing> {
        std::mem::take(&mut *lock(&self.inner.outbox))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn emitter(&self, delivery: Delivery) -> Arc<dyn Emitter> {
        Arc::new(LocalEmitter {
            inner: Arc::clone(&self.inner),
            delivery,
        })
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter for LocalConnection {
    fn emit(&self, event: &str, payload: Payload, ack: Option<AckCallback>) -> Result<(), ConnectionError> {
        self.inner.send(event, payload, ack, Delivery::default())
    }
}

impl Connection for LocalConnection {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn on(&self, event: &str, listener: RawListener) {
        lock(&self.inner.listeners).push((event.to_string(), listener));
    }

    fn remove_all_listeners(&self) {
        lock(&self.inner.listeners).clear();
    }

    fn rooms(&self) -> Vec<Room> {
        lock(&self.inner.rooms).iter().cloned().collect()
    }

    fn join(&self, room: &str) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        lock(&self.inner.rooms).insert(room.to_string());
        Ok(())
    }

    fn leave(&self, room: &str) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        if !lock(&self.inner.rooms).remove(room) {
            return Err(ConnectionError::Room(format!("not a member of '{}'", room)));
        }
        Ok(())
    }

    fn broadcast(&self) -> Arc<dyn Emitter> {
        self.emitter(Delivery {
            broadcast: true,
            ..Delivery::default()
        })
    }

    fn volatile(&self) -> Arc<dyn Emitter> {
        self.emitter(Delivery {
            volatile: true,
            ..Delivery::default()
        })
    }

    fn compress(&self, compress: bool) -> Arc<dyn Emitter> {
        self.emitter(Delivery {
            compress,
            ..Delivery::default()
        })
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        lock(&self.inner.listeners).clear();
        lock(&self.inner.rooms).clear();
        tracing::debug!("[{}] Disconnected", self.inner.id);
        Ok(())
    }
}

/// Emitter sharing a local connection's outbox with fixed delivery flags
struct LocalEmitter {
    inner: Arc<Inner>,
    delivery: Delivery,
}

impl Emitter for LocalEmitter {
    fn emit(&self, event: &str, payload: Payload, ack: Option<AckCallback>) -> Result<(), ConnectionError> {
        self.inner.send(event, payload, ack, self.delivery)
    }
}
