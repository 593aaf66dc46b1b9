use std::sync::Arc;

use futures::future::BoxFuture;

use crate::application::errors::{ConnectionError, SocketError};

/// Message body carried by an event. Opaque to the dispatcher.
pub type Payload = serde_json::Value;

/// Room identifier
pub type Room = String;

/// Reply callback supplied by the remote peer for one inbound message
pub type AckCallback = Arc<dyn Fn(Payload) + Send + Sync>;

/// Future returned by a raw listener. The provider decides whether to await or spawn it.
pub type ListenerFuture = BoxFuture<'static, Result<(), SocketError>>;

/// Listener attached to a connection for a single event name
pub type RawListener = Arc<dyn Fn(Payload, Option<AckCallback>) -> ListenerFuture + Send + Sync>;

/// Anything that can send an event to one or more peers
pub trait Emitter: Send + Sync {
    /// Send `payload` under `event`, optionally asking the peer to acknowledge
    fn emit(&self, event: &str, payload: Payload, ack: Option<AckCallback>) -> Result<(), ConnectionError>;
}

/// Connection provider - one live bidirectional channel to a remote peer.
///
/// Transport, encoding, rooms and acknowledgement delivery all live behind
/// this trait.
pub trait Connection: Emitter {
    /// Connection identifier
    fn id(&self) -> &str;

    /// Attach a raw listener for `event`. Additive: never replaces existing listeners.
    fn on(&self, event: &str, listener: RawListener);

    /// Detach every listener regardless of event
    fn remove_all_listeners(&self);

    /// Rooms this connection currently belongs to
    fn rooms(&self) -> Vec<Room>;

    fn join(&self, room: &str) -> Result<(), ConnectionError>;

    fn leave(&self, room: &str) -> Result<(), ConnectionError>;

    /// Emitter targeting every member of this connection's rooms except itself
    fn broadcast(&self) -> Arc<dyn Emitter>;

    /// Emitter whose messages may be dropped if the peer is not ready
    fn volatile(&self) -> Arc<dyn Emitter>;

    /// Emitter with payload compression toggled
    fn compress(&self, compress: bool) -> Arc<dyn Emitter>;

    fn disconnect(&self) -> Result<(), ConnectionError>;
}
