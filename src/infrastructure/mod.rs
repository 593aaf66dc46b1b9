//! Infrastructure layer - External concerns
//!
//! This layer contains:
//! - Config: Configuration loading
//! - Adapters: Connection providers (in-memory local connection)

pub mod adapters;
pub mod config;
