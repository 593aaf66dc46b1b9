//! Per-connection event dispatch with composable async middleware.
//!
//! A [`Socket`] wraps one live [`Connection`], attaches a listener for every
//! registered handler and runs each inbound event through the configured
//! middleware before the handler. [`Socket::update`] swaps handlers and
//! middleware without touching the connection itself.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::errors::{ConfigError, ConnectionError, SocketError};
pub use application::messaging::{
    from_fn, handler_fn, EventHandler, HandlerResult, Middleware, MiddlewareChain, Next,
    Registrations, Socket, SocketRef, CONNECTION_EVENT,
};
pub use domain::entities::Context;
pub use domain::traits::{AckCallback, Connection, Emitter, ListenerFuture, Payload, RawListener, Room};
