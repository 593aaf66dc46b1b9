//! Domain traits - Abstractions implemented by connection providers

pub mod connection;

pub use connection::{AckCallback, Connection, Emitter, ListenerFuture, Payload, RawListener, Room};
