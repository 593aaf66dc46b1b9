//! Domain entities - Per-message values passed through a dispatch chain

pub mod context;

pub use context::Context;
