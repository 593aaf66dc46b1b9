//! Connection provider adapters

pub mod local;

pub use local::LocalConnection;
