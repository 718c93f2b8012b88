//! Error types for the session layer.

use flagwatch_protocol::ConnectionId;

use crate::SessionState;

/// Errors returned by [`SessionRegistry`](crate::SessionRegistry).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A session with this id is already registered.
    #[error("connection {0} is already registered")]
    DuplicateConnectionId(ConnectionId),

    /// No session is registered under this id.
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    /// The state machine forbids the requested step.
    #[error("connection {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: ConnectionId,
        from: SessionState,
        to: SessionState,
    },
}
