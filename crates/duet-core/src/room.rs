//! Rooms for one-to-one conversations.
//!
//! A room is named after the unordered pair of users it connects and holds
//! the sessions currently subscribed to it.

use crate::session::{SessionHandle, SessionId};
use std::collections::HashMap;
use tracing::debug;

/// Opaque user identity.
pub type UserId = String;

/// A room identifier, derived from two user identities.
pub type RoomId = String;

/// Separator between the two identities of a room id.
pub const ROOM_SEPARATOR: char = ':';

/// Maximum user identity length in bytes.
pub const MAX_USER_ID_LENGTH: usize = 128;

/// Validate a user identity.
///
/// # Errors
///
/// Returns an error message if the identity is invalid.
pub fn validate_user_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("User id cannot be empty");
    }
    if id.len() > MAX_USER_ID_LENGTH {
        return Err("User id too long");
    }
    if id.contains(ROOM_SEPARATOR) {
        return Err("User id cannot contain ':'");
    }
    if id.chars().any(char::is_control) {
        return Err("User id contains control characters");
    }
    Ok(())
}

/// Resolve the room shared by two users.
///
/// The identities are ordered lexicographically before joining, so the
/// result does not depend on argument order.
#[must_use]
pub fn resolve_room(a: &str, b: &str) -> RoomId {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut room = String::with_capacity(low.len() + high.len() + 1);
    room.push_str(low);
    room.push(ROOM_SEPARATOR);
    room.push_str(high);
    room
}

/// A room and its subscribed sessions.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashMap<SessionId, SessionHandle>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: HashMap::new(),
        }
    }

    /// Get the room id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe a session.
    ///
    /// Returns `true` if the session was not already subscribed.
    pub fn join(&mut self, handle: SessionHandle) -> bool {
        let session = handle.id().clone();
        let is_new = self.members.insert(session.clone(), handle).is_none();
        if is_new {
            debug!(room = %self.id, session = %session, "Session joined room");
        }
        is_new
    }

    /// Unsubscribe a session.
    ///
    /// Returns `true` if the session was subscribed.
    pub fn leave(&mut self, session: &SessionId) -> bool {
        let removed = self.members.remove(session).is_some();
        if removed {
            debug!(room = %self.id, session = %session, "Session left room");
        }
        removed
    }

    /// Check if a session is subscribed.
    #[must_use]
    pub fn is_member(&self, session: &SessionId) -> bool {
        self.members.contains_key(session)
    }

    /// Get the number of subscribed sessions.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if the room has no subscribed sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Handles of every subscribed session except `origin`.
    #[must_use]
    pub fn members_except(&self, origin: Option<&SessionId>) -> Vec<SessionHandle> {
        self.members
            .iter()
            .filter(|(id, _)| Some(*id) != origin)
            .map(|(_, handle)| handle.clone())
            .collect()
    }
}
