//! Lifecycle of one accepted connection with respect to the registry.
//!
//! `Unregistered` -> `Registered` | `Closed`, `Registered` -> `Closed`.
//! `Closed` is terminal.

use thiserror::Error;

use super::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unregistered,
    Registered { user_id: String },
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// Registry-facing state of a single connection. Owned by its actor.
pub struct Connection {
    handle: ConnectionHandle,
    registry: ConnectionRegistry,
    state: ConnectionState,
}

impl Connection {
    pub fn new(registry: ConnectionRegistry, handle: ConnectionHandle) -> Self {
        Self {
            handle,
            registry,
            state: ConnectionState::Unregistered,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Registered { user_id } => Some(user_id.as_str()),
            _ => None,
        }
    }

    /// `register-valid`: record the id and insert into the registry.
    /// Only allowed once, from `Unregistered`.
    pub fn register(&mut self, user_id: String) -> Result<Option<ConnectionId>, TransitionError> {
        match self.state {
            ConnectionState::Unregistered => {}
            ConnectionState::Registered { .. } => {
                return Err(TransitionError::AlreadyRegistered(self.id()))
            }
            ConnectionState::Closed => return Err(TransitionError::Closed(self.id())),
        }

        let replaced = self.registry.register(&user_id, self.handle.clone());
        self.state = ConnectionState::Registered { user_id };
        Ok(replaced)
    }

    /// `register-invalid`: the connection never reaches the registry.
    pub fn reject(&mut self) {
        if self.state == ConnectionState::Unregistered {
            self.state = ConnectionState::Closed;
        }
    }

    /// `disconnect` / `error`. Removes the registry entry only if it still
    /// points at this connection. Safe to call any number of times; returns
    /// true only for the call that removed an entry.
    pub fn close(&mut self) -> bool {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);
        match previous {
            ConnectionState::Registered { user_id } => {
                let removed = self.registry.unregister(&user_id, self.id());
                tracing::info!(
                    user_id = %user_id,
                    connection_id = %self.id(),
                    removed_entry = removed,
                    "Registered connection closed"
                );
                removed
            }
            ConnectionState::Unregistered => {
                tracing::info!(
                    connection_id = %self.id(),
                    "Connection closed before registering"
                );
                false
            }
            ConnectionState::Closed => false,
        }
    }
}
