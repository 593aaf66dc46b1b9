//! Socket dispatcher - Binds event handlers and middleware onto a connection

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use futures::FutureExt;

use super::middleware::{handler_fn, Chain, EventHandler, HandlerResult, Middleware, MiddlewareStack};
use crate::application::errors::ConnectionError;
use crate::domain::entities::Context;
use crate::domain::traits::{AckCallback, Connection, Emitter, ListenerFuture, Payload, RawListener, Room};

/// Connection-established event. Consumed by the provider, never attached as a listener.
pub const CONNECTION_EVENT: &str = "connection";

/// Ordered mapping from event name to its terminal handlers
#[derive(Clone, Default)]
pub struct Registrations {
    entries: Vec<(String, Vec<Arc<dyn EventHandler>>)>,
}

impl Registrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event`
    pub fn on<H: EventHandler + 'static>(mut self, event: impl Into<String>, handler: H) -> Self {
        self.insert(event, Arc::new(handler));
        self
    }

    /// Append an async closure as a handler for `event`
    pub fn on_fn<F, Fut>(self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on(event, handler_fn(f))
    }

    /// Append an already shared handler. Events keep the position of their first insertion.
    pub fn insert(&mut self, event: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event = event.into();
        match self.entries.iter_mut().find(|(name, _)| *name == event) {
            Some((_, handlers)) => handlers.push(handler),
            None => self.entries.push((event, vec![handler])),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Arc<dyn EventHandler>])> {
        self.entries
            .iter()
            .map(|(event, handlers)| (event.as_str(), handlers.as_slice()))
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(event, _)| event.as_str())
    }

    /// Total number of handlers across all events
    pub fn handler_count(&self) -> usize {
        self.entries.iter().map(|(_, handlers)| handlers.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Registrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(event, handlers)| (event, handlers.len())))
            .finish()
    }
}

/// Middleware snapshot installed by one `update`
struct DispatchTable {
    version: u64,
    middleware: Option<MiddlewareStack>,
}

struct Shared {
    connection: Box<dyn Connection>,
    table: RwLock<Arc<DispatchTable>>,
}

impl Shared {
    fn table(&self) -> Arc<DispatchTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        tracing::debug!("Socket {} dropped, removing listeners", self.connection.id());
        self.connection.remove_all_listeners();
    }
}

/// Per-connection adapter that runs inbound events through middleware into handlers.
///
/// When the last `Socket` handle for a connection is dropped, every listener
/// on that connection is removed. Handles obtained through
/// [`SocketRef::upgrade`] count too, so a handler holding one keeps the
/// listeners in place until it lets go. The connection itself stays open.
pub struct Socket {
    shared: Arc<Shared>,
}

impl Socket {
    /// Wrap a live connection and install the initial handlers and middleware
    pub fn new<C: Connection + 'static>(
        connection: C,
        registrations: &Registrations,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        let socket = Self {
            shared: Arc::new(Shared {
                connection: Box::new(connection),
                table: RwLock::new(Arc::new(DispatchTable {
                    version: 0,
                    middleware: None,
                })),
            }),
        };
        socket.update(registrations, middleware);
        socket
    }

    /// Replace every handler and the middleware in one step.
    ///
    /// All listeners on the connection are removed first, so afterwards the
    /// connection carries exactly one listener per registered handler.
    /// Chains already running finish with the middleware they started with.
    pub fn update(&self, registrations: &Registrations, middleware: Vec<Arc<dyn Middleware>>) {
        self.shared.connection.remove_all_listeners();

        let table = {
            let mut current = self
                .shared
                .table
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let next = Arc::new(DispatchTable {
                version: current.version + 1,
                middleware: MiddlewareStack::compose(middleware),
            });
            *current = Arc::clone(&next);
            next
        };

        let mut attached = 0usize;
        for (event, handlers) in registrations.iter() {
            if event == CONNECTION_EVENT {
                tracing::trace!("[{}] Skipping reserved event '{}'", self.id(), event);
                continue;
            }
            for handler in handlers {
                self.attach(&table, event, Arc::clone(handler));
                attached += 1;
            }
        }

        tracing::info!(
            "[{}] Dispatch table v{} installed: {} listeners, {} middleware",
            self.id(),
            table.version,
            attached,
            table.middleware.as_ref().map_or(0, MiddlewareStack::len)
        );
    }

    /// Attach one more listener for `event` using the current middleware.
    ///
    /// Additive only: calling it twice with the same handler runs that handler
    /// twice per event until the next `update`.
    pub fn register_handler(&self, event: &str, handler: Arc<dyn EventHandler>) {
        let table = self.shared.table();
        self.attach(&table, event, handler);
    }

    fn attach(&self, table: &DispatchTable, event: &str, handler: Arc<dyn EventHandler>) {
        let chain = Chain::new(table.middleware.clone(), handler);
        let version = table.version;
        let shared = Arc::downgrade(&self.shared);
        let name = event.to_string();

        let listener: RawListener = Arc::new(move |data: Payload, ack: Option<AckCallback>| -> ListenerFuture {
            let socket = SocketRef {
                shared: shared.clone(),
            };
            match socket.version() {
                Some(current) if current == version => {}
                current => {
                    tracing::trace!(
                        "Ignoring '{}' from stale listener v{} (current {:?})",
                        name,
                        version,
                        current
                    );
                    return futures::future::ready(Ok(())).boxed();
                }
            }

            tracing::debug!("Dispatching '{}' (v{})", name, version);
            chain.dispatch(Context::new(name.clone(), data, socket, ack))
        });

        self.shared.connection.on(event, listener);
    }

    /// Version of the installed dispatch table. Starts at 1 and grows with every `update`.
    pub fn version(&self) -> u64 {
        self.shared.table().version
    }

    pub fn has_middleware(&self) -> bool {
        self.shared.table().middleware.is_some()
    }

    /// Non-owning handle to this socket
    pub fn downgrade(&self) -> SocketRef {
        SocketRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn id(&self) -> &str {
        self.shared.connection.id()
    }

    pub fn emit(&self, event: &str, payload: Payload, ack: Option<AckCallback>) -> Result<(), ConnectionError> {
        self.shared.connection.emit(event, payload, ack)
    }

    pub fn broadcast(&self) -> Arc<dyn Emitter> {
        self.shared.connection.broadcast()
    }

    pub fn join(&self, room: &str) -> Result<(), ConnectionError> {
        self.shared.connection.join(room)
    }

    pub fn leave(&self, room: &str) -> Result<(), ConnectionError> {
        self.shared.connection.leave(room)
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.shared.connection.rooms()
    }

    pub fn volatile(&self) -> Arc<dyn Emitter> {
        self.shared.connection.volatile()
    }

    pub fn compress(&self, compress: bool) -> Arc<dyn Emitter> {
        self.shared.connection.compress(compress)
    }

    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.shared.connection.disconnect()
    }
}

impl Emitter for Socket {
    fn emit(&self, event: &str, payload: Payload, ack: Option<AckCallback>) -> Result<(), ConnectionError> {
        Socket::emit(self, event, payload, ack)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("version", &self.version())
            .finish()
    }
}

/// Weak handle to a [`Socket`], carried by every [`Context`]
#[derive(Clone, Default)]
pub struct SocketRef {
    shared: Weak<Shared>,
}

impl SocketRef {
    /// The socket, if it has not been dropped
    pub fn upgrade(&self) -> Option<Socket> {
        self.shared.upgrade().map(|shared| Socket { shared })
    }

    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    pub fn id(&self) -> Option<String> {
        self.shared
            .upgrade()
            .map(|shared| shared.connection.id().to_string())
    }

    /// Emit through the owning socket. Fails with `Closed` once it is gone.
    pub fn emit(&self, event: &str, payload: Payload, ack: Option<AckCallback>) -> Result<(), ConnectionError> {
        match self.shared.upgrade() {
            Some(shared) => shared.connection.emit(event, payload, ack),
            None => Err(ConnectionError::Closed),
        }
    }

    fn version(&self) -> Option<u64> {
        self.shared.upgrade().map(|shared| shared.table().version)
    }
}

impl fmt::Debug for SocketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "SocketRef({})", id),
            None => write!(f, "SocketRef(<dropped>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::messaging::middleware::{from_fn, Next};
    use crate::infrastructure::adapters::local::LocalConnection;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counting(counter: Arc<AtomicUsize>) -> impl Fn(Context, Payload) -> futures::future::Ready<HandlerResult> {
        move |_ctx, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[test]
    fn test_registrations_keep_first_insertion_order() {
        let registrations = Registrations::new()
            .on_fn("b", |_ctx, _data| async { Ok(()) })
            .on_fn("a", |_ctx, _data| async { Ok(()) })
            .on_fn("b", |_ctx, _data| async { Ok(()) });

        assert_eq!(registrations.events().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(registrations.len(), 2);
        assert_eq!(registrations.handler_count(), 3);
    }

    #[tokio::test]
    async fn test_context_carries_event_data_and_socket() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&seen);
        let connection = LocalConnection::with_id("sock-1");
        let registrations = Registrations::new().on_fn("chat", move |ctx, data| {
            let slot = Arc::clone(&slot);
            async move {
                slot.lock().unwrap().push((ctx.event.clone(), data, ctx.socket.id()));
                Ok(())
            }
        });
        let _socket = Socket::new(connection.clone(), &registrations, Vec::new());

        connection.deliver("chat", json!("hi"), None).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("chat".to_string(), json!("hi"), Some("sock-1".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_register_handler_is_additive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connection = LocalConnection::new();
        let socket = Socket::new(connection.clone(), &Registrations::new(), Vec::new());
        let handler: Arc<dyn EventHandler> = Arc::new(handler_fn(counting(Arc::clone(&calls))));

        socket.register_handler("ping", Arc::clone(&handler));
        socket.register_handler("ping", handler);
        connection.deliver("ping", json!(null), None).await;

        assert_eq!(connection.listener_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_register_handler_uses_current_middleware() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let connection = LocalConnection::new();
        let middleware: Arc<dyn Middleware> = Arc::new(from_fn(move |ctx, next: Next| {
            counter.fetch_add(1, Ordering::SeqCst);
            next.run(ctx)
        }));
        let socket = Socket::new(connection.clone(), &Registrations::new(), vec![middleware]);

        socket.register_handler("ping", Arc::new(handler_fn(|_ctx, _data| async { Ok(()) })));
        connection.deliver("ping", json!(null), None).await;

        assert!(socket.has_middleware());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_replaces_handlers() {
        let old_calls = Arc::new(AtomicUsize::new(0));
        let new_calls = Arc::new(AtomicUsize::new(0));
        let connection = LocalConnection::new();
        let socket = Socket::new(
            connection.clone(),
            &Registrations::new().on_fn("chat", counting(Arc::clone(&old_calls))),
            Vec::new(),
        );
        assert_eq!(socket.version(), 1);

        socket.update(
            &Registrations::new().on_fn("chat", counting(Arc::clone(&new_calls))),
            Vec::new(),
        );
        connection.deliver("chat", json!(null), None).await;

        assert_eq!(socket.version(), 2);
        assert_eq!(old_calls.load(Ordering::SeqCst), 0);
        assert_eq!(new_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_socket_removes_listeners() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connection = LocalConnection::new();
        let socket = Socket::new(
            connection.clone(),
            &Registrations::new().on_fn("chat", counting(Arc::clone(&calls))),
            Vec::new(),
        );
        let handle = socket.downgrade();
        drop(socket);

        assert_eq!(connection.listener_count(), 0);
        let results = connection.deliver("chat", json!(null), None).await;

        assert!(connection.is_connected());
        assert!(!handle.is_alive());
        assert!(matches!(handle.emit("x", json!(null), None), Err(ConnectionError::Closed)));
        assert!(results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropping_upgraded_handle_keeps_listeners() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connection = LocalConnection::new();
        let socket = Socket::new(
            connection.clone(),
            &Registrations::new().on_fn("chat", counting(Arc::clone(&calls))),
            Vec::new(),
        );

        let upgraded = socket.downgrade().upgrade();
        assert!(upgraded.is_some());
        drop(upgraded);

        assert_eq!(connection.listener_count(), 1);
        connection.deliver("chat", json!(null), None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(socket);
        assert_eq!(connection.listener_count(), 0);
    }
}
