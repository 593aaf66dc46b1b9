use std::collections::HashMap;
use std::fmt;

use crate::application::messaging::SocketRef;
use crate::domain::traits::{AckCallback, Payload};

/// Packet built for every inbound event and passed through the middleware chain
#[derive(Clone)]
pub struct Context {
    pub event: String,
    pub data: Payload,
    /// Handle back to the dispatcher that received the event. Does not keep it alive.
    pub socket: SocketRef,
    pub acknowledge: Option<AckCallback>,
    /// Values attached by middleware for later links in the chain
    pub state: HashMap<String, Payload>,
}

impl Context {
    pub fn new(
        event: impl Into<String>,
        data: Payload,
        socket: SocketRef,
        acknowledge: Option<AckCallback>,
    ) -> Self {
        Self {
            event: event.into(),
            data,
            socket,
            acknowledge,
            state: HashMap::new(),
        }
    }

    /// Get a value attached by an earlier middleware
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.state.get(key)
    }

    /// Attach a value for later links in the chain
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Payload>) {
        self.state.insert(key.into(), value.into());
    }

    /// Reply through the peer's acknowledge callback.
    ///
    /// Returns `false` when the peer did not ask for an acknowledgement.
    pub fn ack(&self, payload: Payload) -> bool {
        match &self.acknowledge {
            Some(cb) => {
                cb(payload);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("event", &self.event)
            .field("data", &self.data)
            .field("socket", &self.socket)
            .field("acknowledge", &self.acknowledge.is_some())
            .field("state", &self.state)
            .finish()
    }
}
