//! Presence tracking for Duet.
//!
//! Presence is an explicit index from user identity to the sessions that
//! are currently live for it, maintained incrementally on join and
//! disconnect. A user is online while at least one session is registered.

use crate::room::UserId;
use crate::session::{SessionHandle, SessionId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A live session registered for a user.
#[derive(Debug, Clone)]
struct PresenceEntry {
    handle: SessionHandle,
    /// When the session registered, in milliseconds since the epoch.
    since: u64,
}

/// Process-wide presence index.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    online: DashMap<UserId, HashMap<SessionId, PresenceEntry>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session as live for a user.
    ///
    /// Returns `true` if the session was not already registered.
    pub fn register_online(&self, user: &str, handle: &SessionHandle) -> bool {
        let mut sessions = self.online.entry(user.to_string()).or_default();
        if sessions.contains_key(handle.id()) {
            return false;
        }

        sessions.insert(
            handle.id().clone(),
            PresenceEntry {
                handle: handle.clone(),
                since: now_millis(),
            },
        );
        debug!(
            user = %user,
            session = %handle.id(),
            sessions = sessions.len(),
            "Presence: session online"
        );
        true
    }

    /// Remove a session from a user's presence.
    ///
    /// Returns `true` if this was the user's last session, leaving them offline.
    pub fn unregister_online(&self, user: &str, session: &SessionId) -> bool {
        let removed = match self.online.get_mut(user) {
            Some(mut sessions) => sessions.remove(session).is_some(),
            None => return false,
        };

        // Only drop the entry if no session re-registered in the meantime.
        let offline = self
            .online
            .remove_if(user, |_, sessions| sessions.is_empty())
            .is_some();

        if removed {
            debug!(user = %user, session = %session, offline, "Presence: session gone");
        }
        removed && offline
    }

    /// Check if a user has at least one live session.
    #[must_use]
    pub fn is_online(&self, user: &str) -> bool {
        self.online
            .get(user)
            .map(|sessions| !sessions.is_empty())
            .unwrap_or(false)
    }

    /// Handles of every live session for a user, oldest first.
    #[must_use]
    pub fn sessions_for(&self, user: &str) -> Vec<SessionHandle> {
        let Some(sessions) = self.online.get(user) else {
            return Vec::new();
        };

        let mut entries: Vec<&PresenceEntry> = sessions.values().collect();
        entries.sort_by_key(|entry| entry.since);
        entries.into_iter().map(|e| e.handle.clone()).collect()
    }

    /// Number of users currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Number of live sessions across all users.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.online.iter().map(|entry| entry.len()).sum()
    }
}
