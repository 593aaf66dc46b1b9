//! Application layer errors

use thiserror::Error;

/// Errors raised by handlers, middleware or the connection they talk to.
///
/// The dispatcher never produces or rewraps these itself; whatever a handler
/// returns is what the caller of a raw listener sees.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Middleware error: {0}")]
    Middleware(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by a connection provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Emit failed: {0}")]
    Emit(String),

    #[error("Room operation failed: {0}")]
    Room(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
