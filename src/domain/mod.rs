//! Domain layer - Core types shared by the dispatcher and its collaborators
//!
//! This layer contains:
//! - Entities: the per-message Context
//! - Traits: the connection provider contract (Connection, Emitter)

pub mod entities;
pub mod traits;
