//! Connection lifecycle tracking.
//!
//! Every accepted connection has one [`SessionState`] from connect until
//! disconnect. The first join binds the session to a user identity; every
//! join adds a room. Disconnect hands the whole state back so the caller can
//! tear down presence and room subscriptions in one pass.

use crate::room::{RoomId, UserId};
use crate::session::{SessionHandle, SessionId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Errors binding a session to an identity or room.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    /// The session was never connected or already disconnected.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// The session is already bound to another identity.
    #[error("Session is bound to {bound}, cannot join as {requested}")]
    IdentityMismatch { bound: UserId, requested: UserId },

    /// The session already joined the maximum number of rooms.
    #[error("Maximum rooms per session reached")]
    TooManyRooms,
}

/// Everything known about one live session.
#[derive(Debug)]
pub struct SessionState {
    /// Outbound handle of the connection.
    pub handle: SessionHandle,
    /// Identity bound on first join.
    pub user: Option<UserId>,
    /// Rooms joined by this session.
    pub rooms: HashSet<RoomId>,
    /// When the session connected.
    pub connected_at: Instant,
}

impl SessionState {
    fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            user: None,
            rooms: HashSet::new(),
            connected_at: Instant::now(),
        }
    }
}

/// Result of binding a session to a room.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Handle of the bound session.
    pub handle: SessionHandle,
    /// Whether the room was not yet joined by this session.
    pub new_room: bool,
}

/// Table of live sessions.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    sessions: DashMap<SessionId, SessionState>,
}

impl ConnectionManager {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    ///
    /// Returns `false` if a session with the same ID is already registered.
    pub fn connect(&self, handle: SessionHandle) -> bool {
        let id = handle.id().clone();
        match self.sessions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SessionState::new(handle));
                debug!(session = %id, "Session connected");
                true
            }
        }
    }

    /// Bind a session to a user and add a room to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown, bound to another user, or
    /// would exceed `max_rooms`.
    pub fn bind(
        &self,
        session: &SessionId,
        user: &str,
        room: &str,
        max_rooms: usize,
    ) -> Result<Binding, BindError> {
        let mut state = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| BindError::UnknownSession(session.clone()))?;

        if !state.rooms.contains(room) && state.rooms.len() >= max_rooms {
            return Err(BindError::TooManyRooms);
        }

        match state.user.clone() {
            Some(bound) if bound != user => {
                return Err(BindError::IdentityMismatch {
                    bound,
                    requested: user.to_string(),
                });
            }
            Some(_) => {}
            None => {
                state.user = Some(user.to_string());
                debug!(session = %session, user = %user, "Session bound to user");
            }
        }

        let new_room = state.rooms.insert(room.to_string());
        Ok(Binding {
            handle: state.handle.clone(),
            new_room,
        })
    }

    /// Remove a session, returning its final state.
    ///
    /// Returns `None` if the session is unknown, which makes repeated
    /// disconnects harmless.
    pub fn disconnect(&self, session: &SessionId) -> Option<SessionState> {
        let (_, state) = self.sessions.remove(session)?;
        debug!(
            session = %session,
            user = state.user.as_deref().unwrap_or("-"),
            rooms = state.rooms.len(),
            lifetime_ms = state.connected_at.elapsed().as_millis() as u64,
            "Session disconnected"
        );
        Some(state)
    }

    /// Identity bound to a session, if any.
    #[must_use]
    pub fn user_of(&self, session: &SessionId) -> Option<UserId> {
        self.sessions.get(session).and_then(|s| s.user.clone())
    }

    /// Check if a session has joined a room.
    #[must_use]
    pub fn is_in_room(&self, session: &SessionId, room: &str) -> bool {
        self.sessions
            .get(session)
            .map(|s| s.rooms.contains(room))
            .unwrap_or(false)
    }

    /// Check if a session is registered.
    #[must_use]
    pub fn contains(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total number of room subscriptions across sessions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.sessions.iter().map(|s| s.rooms.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> SessionHandle {
        SessionHandle::channel(SessionId::new(id), 1).0
    }

    #[test]
    fn test_connect_bind_disconnect() {
        let manager = ConnectionManager::new();
        let s1 = handle("s1");

        assert!(manager.connect(s1.clone()));
        assert!(!manager.connect(s1.clone()));
        assert_eq!(manager.user_of(s1.id()), None);

        let binding = manager.bind(s1.id(), "alice", "alice:bob", 8).unwrap();
        assert!(binding.new_room);
        assert!(!manager.bind(s1.id(), "alice", "alice:bob", 8).unwrap().new_room);
        assert!(manager.bind(s1.id(), "alice", "alice:carol", 8).unwrap().new_room);

        assert_eq!(manager.user_of(s1.id()), Some("alice".to_string()));
        assert!(manager.is_in_room(s1.id(), "alice:carol"));
        assert_eq!(manager.subscription_count(), 2);

        let state = manager.disconnect(s1.id()).unwrap();
        assert_eq!(state.rooms.len(), 2);
        assert!(manager.disconnect(s1.id()).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_identity_is_fixed_after_first_join() {
        let manager = ConnectionManager::new();
        let s1 = handle("s1");
        manager.connect(s1.clone());
        manager.bind(s1.id(), "alice", "alice:bob", 8).unwrap();

        let err = manager.bind(s1.id(), "mallory", "bob:mallory", 8).unwrap_err();
        assert!(matches!(err, BindError::IdentityMismatch { .. }));
        assert!(!manager.is_in_room(s1.id(), "bob:mallory"));
    }

    #[test]
    fn test_bind_unknown_session() {
        let manager = ConnectionManager::new();
        assert_eq!(
            manager
                .bind(&SessionId::new("nope"), "alice", "alice:bob", 8)
                .unwrap_err(),
            BindError::UnknownSession(SessionId::new("nope"))
        );
    }

    #[test]
    fn test_room_cap() {
        let manager = ConnectionManager::new();
        let s1 = handle("s1");
        manager.connect(s1.clone());

        manager.bind(s1.id(), "alice", "alice:bob", 1).unwrap();
        // Rejoining a known room does not count against the cap.
        manager.bind(s1.id(), "alice", "alice:bob", 1).unwrap();
        assert_eq!(
            manager.bind(s1.id(), "alice", "alice:carol", 1).unwrap_err(),
            BindError::TooManyRooms
        );
    }
}
