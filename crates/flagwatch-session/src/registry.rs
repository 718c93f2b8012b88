//! The session registry: every open watch in the process.
//!
//! # Concurrency note
//!
//! Lookups take a shared lock and inserts/updates/removals an exclusive
//! one. The lock is a `std` lock so that [`SessionRegistry::remove`] can
//! run from a `Drop` impl when a watch task unwinds.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use flagwatch_feed::SubscriptionId;
use flagwatch_protocol::ConnectionId;

use crate::{ConnectionSession, SessionError, SessionState};

/// Thread-safe table of open watches, keyed by connection id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, ConnectionSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session`, failing if its id is taken.
    pub fn try_register(
        &self,
        session: ConnectionSession,
    ) -> Result<ConnectionId, SessionError> {
        let id = session.connection_id;
        let mut sessions = self.write();
        if sessions.contains_key(&id) {
            return Err(SessionError::DuplicateConnectionId(id));
        }
        sessions.insert(id, session);
        tracing::info!(
            connection_id = %id,
            active = sessions.len(),
            "connection registered"
        );
        Ok(id)
    }

    /// Inserts `session`, replacing its id with a fresh one until it is
    /// unique. Returns the id it was registered under.
    pub fn register(&self, mut session: ConnectionSession) -> ConnectionId {
        loop {
            match self.try_register(session.clone()) {
                Ok(id) => return id,
                Err(e) => {
                    tracing::warn!(error = %e, "connection id collision, regenerating");
                    session.connection_id = ConnectionId::generate();
                }
            }
        }
    }

    /// A copy of the session registered under `id`.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionSession> {
        self.read().get(id).cloned()
    }

    /// Moves the session to `to`. Returns the previous state.
    ///
    /// Re-closing a closing session succeeds without changing it.
    pub fn transition(
        &self,
        id: &ConnectionId,
        to: SessionState,
    ) -> Result<SessionState, SessionError> {
        let mut sessions = self.write();
        let session = sessions.get_mut(id).ok_or(SessionError::NotFound(*id))?;
        let from = session.state;
        if !from.can_transition_to(to) {
            return Err(SessionError::InvalidTransition { id: *id, from, to });
        }
        if !(from.is_closing() && to == SessionState::Closing) {
            session.state = to;
            tracing::debug!(connection_id = %id, %from, %to, "session state changed");
        }
        Ok(from)
    }

    /// Records the feed subscription serving this session.
    pub fn attach(
        &self,
        id: &ConnectionId,
        subscription: SubscriptionId,
    ) -> Result<(), SessionError> {
        let mut sessions = self.write();
        let session = sessions.get_mut(id).ok_or(SessionError::NotFound(*id))?;
        session.subscription = Some(subscription);
        Ok(())
    }

    /// Removes the session, marking the returned record `Closed`.
    /// Returns `None` if it was already gone.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionSession> {
        let mut sessions = self.write();
        let mut session = sessions.remove(id)?;
        session.state = SessionState::Closed;
        tracing::info!(
            connection_id = %id,
            active = sessions.len(),
            "connection removed"
        );
        Some(session)
    }

    /// Every registered session, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionSession> {
        let mut sessions: Vec<_> = self.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.started);
        sessions
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, ConnectionSession>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, ConnectionSession>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

// =========================================================================
// Tests
// =========================================================================
