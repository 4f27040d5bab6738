//! Session handles and the delivery commands routed to them.
//!
//! A [`SessionHandle`] is the sending half of a connection's outbound queue.
//! Delivering never blocks: a full or closed queue fails that one delivery
//! and leaves every other session untouched.

use duet_protocol::{ChatMessage, DeletionNotice, StoredMessage};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique session ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sess_{n:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A command for the connection that owns a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A live message from the peer.
    Message(ChatMessage),
    /// The whole backlog stored while the user was offline.
    Backlog(Vec<StoredMessage>),
    /// The peer deleted a message.
    Deleted(DeletionNotice),
}

/// The target session can no longer accept deliveries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionGone {
    /// The outbound queue is full; the connection is not keeping up.
    #[error("Outbound queue of session {0} is full")]
    QueueFull(SessionId),

    /// The connection task has exited.
    #[error("Session {0} is closed")]
    Closed(SessionId),
}

/// Sending half of a session's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<Delivery>,
}

impl SessionHandle {
    /// Wrap an existing queue sender.
    #[must_use]
    pub fn new(id: SessionId, sender: mpsc::Sender<Delivery>) -> Self {
        Self { id, sender }
    }

    /// Create a handle together with the receiving end of its queue.
    #[must_use]
    pub fn channel(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(id, sender), receiver)
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Queue a delivery for this session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionGone`] if the queue is full or closed.
    pub fn deliver(&self, delivery: Delivery) -> Result<(), SessionGone> {
        match self.sender.try_send(delivery) {
            Ok(()) => {
                trace!(session = %self.id, "Delivery queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SessionGone::QueueFull(self.id.clone())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionGone::Closed(self.id.clone())),
        }
    }

    /// Check if the connection task has dropped its receiver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> ChatMessage {
        ChatMessage::new("a", "b", "hi", "text", "10:00", "2024-01-01")
    }

    #[test]
    fn test_session_id_generation() {
        let id1 = SessionId::generate();
        let id2 = SessionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("sess_"));
    }

    #[tokio::test]
    async fn test_deliver_in_order() {
        let (handle, mut rx) = SessionHandle::channel(SessionId::new("s1"), 8);

        handle.deliver(Delivery::Message(chat())).unwrap();
        handle.deliver(Delivery::Backlog(vec![])).unwrap();

        assert_eq!(rx.recv().await, Some(Delivery::Message(chat())));
        assert_eq!(rx.recv().await, Some(Delivery::Backlog(vec![])));
    }

    #[test]
    fn test_full_queue_is_isolated() {
        let (handle, _rx) = SessionHandle::channel(SessionId::new("s1"), 1);

        handle.deliver(Delivery::Message(chat())).unwrap();
        assert_eq!(
            handle.deliver(Delivery::Message(chat())),
            Err(SessionGone::QueueFull(SessionId::new("s1")))
        );
    }

    #[test]
    fn test_closed_session() {
        let (handle, rx) = SessionHandle::channel(SessionId::new("s1"), 1);
        drop(rx);

        assert!(handle.is_closed());
        assert!(matches!(
            handle.deliver(Delivery::Backlog(vec![])),
            Err(SessionGone::Closed(_))
        ));
    }
}
