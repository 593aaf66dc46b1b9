//! Event handling - Middleware chains and the per-connection dispatcher

pub mod dispatcher;
pub mod middleware;

pub use dispatcher::{Registrations, Socket, SocketRef, CONNECTION_EVENT};
pub use middleware::{
    from_fn, handler_fn, Chain, EventHandler, HandlerResult, LoggingMiddleware, Middleware,
    MiddlewareChain, MiddlewareStack, Next, RateLimitMiddleware, TimestampMiddleware,
};
