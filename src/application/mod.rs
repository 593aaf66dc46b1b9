//! Application layer - Dispatch logic
//!
//! This layer contains:
//! - Errors: Socket, connection and config errors
//! - Messaging: Middleware composition and the Socket dispatcher

pub mod errors;
pub mod messaging;
