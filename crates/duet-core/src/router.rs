//! Presence-aware message router for Duet.
//!
//! The router decides, for every inbound event, between live delivery to the
//! sessions of a room and persistence for a receiver that is offline. It owns
//! the presence index, the room table and the session table; storage is
//! reached through a [`MessageStore`] and connections through their
//! [`SessionHandle`]s.

use crate::lifecycle::{BindError, ConnectionManager};
use crate::message::{validate_chat, validate_deletion, DEFAULT_MAX_MESSAGE_LENGTH};
use crate::presence::PresenceRegistry;
use crate::room::{resolve_room, validate_user_id, Room, RoomId, UserId};
use crate::session::{Delivery, SessionGone, SessionHandle, SessionId};
use crate::store::{MessageStore, StoreError};
use dashmap::DashMap;
use duet_protocol::{codec, ChatMessage, DeletionNotice, MessageId, StoredMessage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The event payload was rejected; the connection stays usable.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The store failed or timed out; delivery is uncertain.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The session a delivery was addressed to is gone.
    #[error(transparent)]
    SessionGone(#[from] SessionGone),

    /// The session was never connected or already disconnected.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
}

impl RouterError {
    fn validation(reason: impl Into<String>) -> Self {
        RouterError::Validation(reason.into())
    }
}

impl From<BindError> for RouterError {
    fn from(err: BindError) -> Self {
        match err {
            BindError::UnknownSession(id) => RouterError::UnknownSession(id),
            other => RouterError::Validation(other.to_string()),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound for a single store operation.
    pub store_timeout: Duration,
    /// Maximum message body length in bytes.
    pub max_message_length: usize,
    /// Maximum rooms a single session may join.
    pub max_rooms_per_session: usize,
    /// Maximum messages in one backlog delivery.
    pub backlog_batch: usize,
    /// Approximate encoded size budget of one backlog delivery.
    pub backlog_batch_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_rooms_per_session: 100,
            backlog_batch: 256,
            backlog_batch_bytes: codec::MAX_FRAME_SIZE / 4,
        }
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The room the session joined.
    pub room: RoomId,
    /// Whether the session was not already subscribed to the room.
    pub new_subscription: bool,
    /// Number of backlog messages flushed to the session.
    pub backlog: usize,
}

/// Result of pushing one event to the sessions of a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Sessions that accepted the event.
    pub delivered: usize,
    /// Sessions skipped because their queue was full or closed.
    pub skipped: usize,
}

/// How a message was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The receiver was online; the message went to the room's sessions.
    Delivered(Fanout),
    /// The receiver was offline; the message was stored.
    Stored {
        /// Identifier assigned by the store.
        id: MessageId,
    },
}

/// The central message router.
pub struct Router {
    store: Arc<dyn MessageStore>,
    presence: PresenceRegistry,
    /// Rooms indexed by id, holding their subscribed sessions.
    rooms: DashMap<RoomId, Room>,
    connections: ConnectionManager,
    /// Serializes backlog flushes per receiver.
    flush_locks: DashMap<UserId, Arc<Mutex<()>>>,
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_config(store, RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn MessageStore>, config: RouterConfig) -> Self {
        info!(store = store.name(), "Creating router with config: {:?}", config);
        Self {
            store,
            presence: PresenceRegistry::new(),
            rooms: DashMap::new(),
            connections: ConnectionManager::new(),
            flush_locks: DashMap::new(),
            config,
        }
    }

    /// The presence index.
    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The backing message store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            room_count: self.rooms.len(),
            session_count: self.connections.len(),
            online_users: self.presence.online_count(),
            total_subscriptions: self.connections.subscription_count(),
        }
    }

    /// Number of sessions subscribed to a room.
    #[must_use]
    pub fn room_members(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.member_count()).unwrap_or(0)
    }

    /// Register a newly accepted connection.
    ///
    /// Returns `false` if the session was already registered.
    pub fn on_connect(&self, handle: SessionHandle) -> bool {
        self.connections.connect(handle)
    }

    /// Join `session` to the room shared by `user` and `target`, then flush
    /// the user's backlog to it.
    ///
    /// The backlog goes out as one delivery unless it exceeds the configured
    /// batch limits, in which case it is split into consecutive deliveries in
    /// insertion order. Records are marked delivered only after the session
    /// accepted them.
    ///
    /// Joining a room the session is already in changes nothing and finds
    /// no backlog that was already flushed.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed ids, `UnknownSession` for a session
    /// that is not connected, `StorageUnavailable` if the backlog could not
    /// be read or marked, and `SessionGone` if the session's queue refused
    /// the backlog. In the last two cases the join itself has taken effect
    /// and unaccepted messages stay pending.
    pub async fn on_join(
        &self,
        session: &SessionId,
        user: &str,
        target: &str,
    ) -> Result<JoinOutcome, RouterError> {
        validate_user_id(user).map_err(RouterError::validation)?;
        validate_user_id(target).map_err(RouterError::validation)?;
        if user == target {
            return Err(RouterError::validation("Cannot join a room with yourself"));
        }

        let room_id = resolve_room(user, target);
        let binding = self.connections.bind(
            session,
            user,
            &room_id,
            self.config.max_rooms_per_session,
        )?;

        let subscribed = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(room_id.clone()))
            .join(binding.handle.clone());
        self.presence.register_online(user, &binding.handle);

        let flushed = self.flush_backlog(user, &binding.handle).await?;

        debug!(
            session = %session,
            user = %user,
            room = %room_id,
            new = subscribed,
            backlog = flushed,
            "Joined"
        );

        Ok(JoinOutcome {
            room: room_id,
            new_subscription: subscribed,
            backlog: flushed,
        })
    }

    /// Route a message: live to the room if the receiver is online, into the
    /// store otherwise.
    ///
    /// `origin` is the submitting session; it is excluded from the live
    /// fan-out and, once bound, must belong to the sender.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed message or a sender that does not
    /// match the origin session, and `StorageUnavailable` if the receiver is
    /// offline and the store failed.
    pub async fn on_send(
        &self,
        origin: Option<&SessionId>,
        message: ChatMessage,
    ) -> Result<SendOutcome, RouterError> {
        validate_chat(&message, self.config.max_message_length)
            .map_err(RouterError::validation)?;
        if let Some(origin) = origin {
            self.check_origin(origin, &message.sender_id)?;
        }

        let room_id = resolve_room(&message.sender_id, &message.receiver_id);

        if self.presence.is_online(&message.receiver_id) {
            let fanout = self.broadcast(&room_id, origin, &Delivery::Message(message));
            debug!(room = %room_id, recipients = fanout.delivered, "Message delivered live");
            return Ok(SendOutcome::Delivered(fanout));
        }

        let receiver = message.receiver_id.clone();
        let stored = self
            .with_store_timeout("enqueue", self.store.enqueue(message))
            .await?;
        debug!(room = %room_id, receiver = %receiver, id = stored.id, "Message stored for offline receiver");

        Ok(SendOutcome::Stored { id: stored.id })
    }

    /// Broadcast a deletion notice to every session of the room.
    ///
    /// Nothing is stored: a receiver that is offline never sees the notice.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed notice, or when the origin session
    /// belongs to someone else or has not joined the room.
    pub fn on_delete(
        &self,
        origin: Option<&SessionId>,
        notice: DeletionNotice,
    ) -> Result<Fanout, RouterError> {
        validate_deletion(&notice, self.config.max_message_length)
            .map_err(RouterError::validation)?;

        let room_id = resolve_room(&notice.sender_id, &notice.receiver_id);
        if let Some(origin) = origin {
            self.check_origin(origin, &notice.sender_id)?;
            if !self.connections.is_in_room(origin, &room_id) {
                return Err(RouterError::validation("Join the room before deleting"));
            }
        }

        let fanout = self.broadcast(&room_id, None, &Delivery::Deleted(notice));
        debug!(room = %room_id, recipients = fanout.delivered, "Deletion notice broadcast");
        Ok(fanout)
    }

    /// Tear down a session: every room subscription and its presence entry.
    ///
    /// Safe to call for sessions that never joined, never connected, or were
    /// already disconnected. Returns `true` if the session was known.
    pub fn on_disconnect(&self, session: &SessionId) -> bool {
        let Some(state) = self.connections.disconnect(session) else {
            debug!(session = %session, "Disconnect for unknown session");
            return false;
        };

        for room_id in &state.rooms {
            let now_empty = match self.rooms.get_mut(room_id) {
                Some(mut room) => {
                    room.leave(session);
                    room.is_empty()
                }
                None => false,
            };
            if now_empty {
                // A concurrent join may have refilled the room.
                if self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some() {
                    debug!(room = %room_id, "Deleted empty room");
                }
            }
        }

        if let Some(user) = &state.user {
            if self.presence.unregister_online(user, session) {
                info!(user = %user, "User offline");
            }
        }

        true
    }

    /// Push the pending backlog of `user` to `handle`, one batch at a time.
    ///
    /// Only one flush per user runs at a time, so two sessions of the same
    /// user never receive the same record.
    async fn flush_backlog(&self, user: &str, handle: &SessionHandle) -> Result<usize, RouterError> {
        let lock = self.flush_locks.entry(user.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.flush_batches(user, handle).await
        };
        drop(lock);
        self.flush_locks
            .remove_if(user, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn flush_batches(&self, user: &str, handle: &SessionHandle) -> Result<usize, RouterError> {
        let limit = self.config.backlog_batch.max(1);
        let mut flushed = 0;

        loop {
            let mut pending = self
                .with_store_timeout("read backlog", self.store.pending_for(user, limit))
                .await?;
            let fetched = pending.len();
            let batch_len = batch_within(&pending, self.config.backlog_batch_bytes);
            pending.truncate(batch_len);
            if pending.is_empty() {
                return Ok(flushed);
            }

            let ids: Vec<MessageId> = pending.iter().map(|m| m.id).collect();
            for record in &mut pending {
                record.delivered = true;
            }
            handle.deliver(Delivery::Backlog(pending)).map_err(|gone| {
                warn!(user = %user, kept = ids.len(), error = %gone, "Backlog flush refused, messages stay pending");
                gone
            })?;

            let claimed = self
                .with_store_timeout("mark delivered", self.store.mark_delivered(user, &ids))
                .await?;
            if claimed.len() < ids.len() {
                error!(
                    user = %user,
                    sent = ids.len(),
                    claimed = claimed.len(),
                    "Backlog records were claimed elsewhere"
                );
            }
            flushed += ids.len();
            trace!(user = %user, batch = ids.len(), "Backlog batch flushed");

            if claimed.is_empty() || (batch_len == fetched && fetched < limit) {
                return Ok(flushed);
            }
        }
    }

    /// Deliver to every session of a room except `exclude`.
    ///
    /// A session that cannot accept the delivery is skipped and logged.
    fn broadcast(&self, room_id: &str, exclude: Option<&SessionId>, delivery: &Delivery) -> Fanout {
        let targets = self
            .rooms
            .get(room_id)
            .map(|room| room.members_except(exclude))
            .unwrap_or_default();

        let mut fanout = Fanout::default();
        for target in targets {
            match target.deliver(delivery.clone()) {
                Ok(()) => {
                    trace!(room = %room_id, session = %target.id(), "Delivered");
                    fanout.delivered += 1;
                }
                Err(gone) => {
                    warn!(room = %room_id, error = %gone, "Skipping session");
                    fanout.skipped += 1;
                }
            }
        }
        fanout
    }

    fn check_origin(&self, origin: &SessionId, sender: &str) -> Result<(), RouterError> {
        if !self.connections.contains(origin) {
            return Err(RouterError::UnknownSession(origin.clone()));
        }
        match self.connections.user_of(origin) {
            Some(bound) if bound != sender => Err(RouterError::validation(format!(
                "Session is bound to {bound}, cannot act as {sender}"
            ))),
            _ => Ok(()),
        }
    }

    async fn with_store_timeout<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, RouterError> {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                error!(op, store = self.store.name(), error = %err, "Store operation failed");
                Err(RouterError::StorageUnavailable(err.to_string()))
            }
            Err(_) => {
                error!(op, store = self.store.name(), timeout = ?self.config.store_timeout, "Store operation timed out");
                Err(RouterError::StorageUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.config.store_timeout
                )))
            }
        }
    }
}

/// Rough size of a record once encoded, field names included.
fn encoded_size_hint(record: &StoredMessage) -> usize {
    const FRAMING: usize = 128;
    FRAMING
        + record.sender_id.len()
        + record.receiver_id.len()
        + record.message.len()
        + record.kind.len()
        + record.time.len()
        + record.date.len()
}

/// Length of the longest prefix of `records` within `budget` bytes; at least
/// one record when there is any.
fn batch_within(records: &[StoredMessage], budget: usize) -> usize {
    let mut used = 0;
    for (index, record) in records.iter().enumerate() {
        used += encoded_size_hint(record);
        if used > budget {
            return index.max(1);
        }
    }
    records.len()
}

/// Router statistics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RouterStats {
    /// Number of rooms with at least one session.
    pub room_count: usize,
    /// Number of connected sessions.
    pub session_count: usize,
    /// Number of users with at least one joined session.
    pub online_users: usize,
    /// Total number of room subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use duet_protocol::StoredMessage;
    use tokio::sync::mpsc;

    fn chat(from: &str, to: &str, body: &str) -> ChatMessage {
        ChatMessage::new(from, to, body, "text", "10:00", "2024-01-01")
    }

    fn connect(router: &Router, id: &str) -> (SessionId, mpsc::Receiver<Delivery>) {
        let (handle, rx) = SessionHandle::channel(SessionId::new(id), 64);
        assert!(router.on_connect(handle));
        (SessionId::new(id), rx)
    }

    fn memory_router() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Router::new(store.clone()), store)
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn enqueue(&self, _message: ChatMessage) -> Result<StoredMessage, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn pending_for(&self, _: &str, _: usize) -> Result<Vec<StoredMessage>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn mark_delivered(
            &self,
            _: &str,
            _: &[MessageId],
        ) -> Result<Vec<MessageId>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn messages_for(&self, _: &str) -> Result<Vec<StoredMessage>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl MessageStore for StalledStore {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn enqueue(&self, _message: ChatMessage) -> Result<StoredMessage, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Unavailable("unreachable".into()))
        }

        async fn pending_for(&self, _: &str, _: usize) -> Result<Vec<StoredMessage>, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn mark_delivered(
            &self,
            _: &str,
            _: &[MessageId],
        ) -> Result<Vec<MessageId>, StoreError> {
            Ok(Vec::new())
        }

        async fn messages_for(&self, _: &str) -> Result<Vec<StoredMessage>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Memory store whose backlog reads finish on a detached task after a
    /// delay, the way blocking work outlives a dropped join handle.
    struct DetachedReadStore {
        inner: Arc<MemoryStore>,
        delay: std::sync::Mutex<Duration>,
    }

    #[async_trait]
    impl MessageStore for DetachedReadStore {
        fn name(&self) -> &'static str {
            "detached"
        }

        async fn enqueue(&self, message: ChatMessage) -> Result<StoredMessage, StoreError> {
            self.inner.enqueue(message).await
        }

        async fn pending_for(
            &self,
            receiver: &str,
            limit: usize,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            let delay = *self.delay.lock().unwrap();
            let inner = Arc::clone(&self.inner);
            let receiver = receiver.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.pending_for(&receiver, limit).await
            })
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?
        }

        async fn mark_delivered(
            &self,
            receiver: &str,
            ids: &[MessageId],
        ) -> Result<Vec<MessageId>, StoreError> {
            self.inner.mark_delivered(receiver, ids).await
        }

        async fn messages_for(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError> {
            self.inner.messages_for(receiver).await
        }
    }

    #[tokio::test]
    async fn test_live_send_reaches_peer_without_echo() {
        let (router, store) = memory_router();
        let (a, mut rx_a) = connect(&router, "s-a");
        let (b, mut rx_b) = connect(&router, "s-b");
        router.on_join(&a, "A", "B").await.unwrap();
        router.on_join(&b, "B", "A").await.unwrap();

        let outcome = router.on_send(Some(&a), chat("A", "B", "hello")).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Delivered(Fanout {
                delivered: 1,
                skipped: 0
            })
        );

        match rx_b.try_recv().unwrap() {
            Delivery::Message(msg) => {
                assert_eq!(msg.sender_id, "A");
                assert_eq!(msg.message, "hello");
            }
            other => panic!("unexpected delivery {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
        assert_eq!(store.pending_count(), 0);
        assert!(store.messages_for("B").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_send_is_stored() {
        let (router, store) = memory_router();
        let (a, mut rx_a) = connect(&router, "s-a");
        router.on_join(&a, "A", "B").await.unwrap();

        let outcome = router.on_send(Some(&a), chat("A", "B", "hi")).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Stored { .. }));

        assert!(rx_a.try_recv().is_err());
        let stored = store.messages_for("B").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender_id, "A");
        assert_eq!(stored[0].receiver_id, "B");
        assert_eq!(stored[0].message, "hi");
        assert!(!stored[0].delivered);
    }

    #[tokio::test]
    async fn test_offline_then_join_scenario() {
        let (router, store) = memory_router();

        // A sends without a session of its own.
        router.on_send(None, chat("A", "B", "hi")).await.unwrap();

        let (b, mut rx_b) = connect(&router, "s-b");
        let outcome = router.on_join(&b, "B", "A").await.unwrap();
        assert_eq!(outcome.backlog, 1);

        match rx_b.try_recv().unwrap() {
            Delivery::Backlog(messages) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message, "hi");
                assert_eq!(messages[0].kind, "text");
                assert_eq!(messages[0].time, "10:00");
                assert_eq!(messages[0].date, "2024-01-01");
            }
            other => panic!("unexpected delivery {other:?}"),
        }

        let history = store.messages_for("B").await.unwrap();
        assert!(history[0].delivered);
    }

    #[tokio::test]
    async fn test_backlog_flushed_once_in_order() {
        let (router, store) = memory_router();
        let (a, _rx_a) = connect(&router, "s-a");
        router.on_join(&a, "A", "B").await.unwrap();
        for body in ["one", "two", "three"] {
            router.on_send(Some(&a), chat("A", "B", body)).await.unwrap();
        }

        let (b, mut rx_b) = connect(&router, "s-b");
        router.on_join(&b, "B", "A").await.unwrap();

        let Delivery::Backlog(messages) = rx_b.try_recv().unwrap() else {
            panic!("expected a single backlog delivery");
        };
        let bodies: Vec<_> = messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
        assert!(rx_b.try_recv().is_err());
        assert!(store.drain_undelivered("B").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let (router, _store) = memory_router();
        router.on_send(None, chat("A", "B", "hi")).await.unwrap();

        let (b, mut rx_b) = connect(&router, "s-b");
        let first = router.on_join(&b, "B", "A").await.unwrap();
        let second = router.on_join(&b, "B", "A").await.unwrap();

        assert!(first.new_subscription);
        assert!(!second.new_subscription);
        assert_eq!(second.backlog, 0);
        assert_eq!(router.room_members(&first.room), 1);
        assert_eq!(router.stats().total_subscriptions, 1);

        assert!(matches!(rx_b.try_recv(), Ok(Delivery::Backlog(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_without_join() {
        let (router, _store) = memory_router();
        let (s, _rx) = connect(&router, "s-1");

        assert!(router.on_disconnect(&s));
        assert!(!router.on_disconnect(&s));
        assert!(!router.on_disconnect(&SessionId::new("never-connected")));
        assert_eq!(
            router.stats(),
            RouterStats {
                room_count: 0,
                session_count: 0,
                online_users: 0,
                total_subscriptions: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_takes_user_offline() {
        let (router, store) = memory_router();
        let (a, _rx_a) = connect(&router, "s-a");
        let (b, _rx_b) = connect(&router, "s-b");
        router.on_join(&a, "A", "B").await.unwrap();
        router.on_join(&b, "B", "A").await.unwrap();
        assert!(router.presence().is_online("B"));

        router.on_disconnect(&b);
        assert!(!router.presence().is_online("B"));
        assert_eq!(router.room_members(&resolve_room("A", "B")), 1);

        let outcome = router.on_send(Some(&a), chat("A", "B", "later")).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Stored { .. }));
        assert_eq!(store.pending_count(), 1);

        router.on_disconnect(&a);
        assert_eq!(router.stats().room_count, 0);
    }

    #[tokio::test]
    async fn test_dead_session_does_not_block_others() {
        let (router, _store) = memory_router();
        let (a, _rx_a) = connect(&router, "s-a");
        let (phone, mut rx_phone) = connect(&router, "s-phone");
        let (laptop, rx_laptop) = connect(&router, "s-laptop");
        router.on_join(&a, "A", "B").await.unwrap();
        router.on_join(&laptop, "B", "A").await.unwrap();
        router.on_join(&phone, "B", "A").await.unwrap();

        // The laptop's connection task died without disconnecting.
        drop(rx_laptop);

        let outcome = router.on_send(Some(&a), chat("A", "B", "hey")).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Delivered(Fanout {
                delivered: 1,
                skipped: 1
            })
        );
        assert!(matches!(rx_phone.try_recv(), Ok(Delivery::Message(_))));
    }

    #[tokio::test]
    async fn test_online_receiver_outside_room_gets_nothing() {
        let (router, store) = memory_router();
        let (b, mut rx_b) = connect(&router, "s-b");
        router.on_join(&b, "B", "C").await.unwrap();

        let outcome = router.on_send(None, chat("A", "B", "hi")).await.unwrap();
        assert_eq!(outcome, SendOutcome::Delivered(Fanout::default()));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_live_order_is_preserved() {
        let (router, _store) = memory_router();
        let (a, _rx_a) = connect(&router, "s-a");
        let (b, mut rx_b) = connect(&router, "s-b");
        router.on_join(&a, "A", "B").await.unwrap();
        router.on_join(&b, "B", "A").await.unwrap();

        for i in 0..50 {
            router
                .on_send(Some(&a), chat("A", "B", &i.to_string()))
                .await
                .unwrap();
        }

        for i in 0..50 {
            match rx_b.recv().await {
                Some(Delivery::Message(msg)) => assert_eq!(msg.message, i.to_string()),
                other => panic!("unexpected delivery {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_delete_reaches_whole_room_and_is_not_stored() {
        let (router, store) = memory_router();
        let (a, mut rx_a) = connect(&router, "s-a");
        let (b, mut rx_b) = connect(&router, "s-b");
        router.on_join(&a, "A", "B").await.unwrap();
        router.on_join(&b, "B", "A").await.unwrap();

        let notice = DeletionNotice {
            sender_id: "A".into(),
            receiver_id: "B".into(),
            message: "oops".into(),
            time: "10:01".into(),
            date: "2024-01-01".into(),
        };
        assert_eq!(router.on_delete(Some(&a), notice.clone()).unwrap().delivered, 2);
        assert_eq!(rx_a.try_recv().unwrap(), Delivery::Deleted(notice.clone()));
        assert_eq!(rx_b.try_recv().unwrap(), Delivery::Deleted(notice.clone()));

        router.on_disconnect(&b);
        assert_eq!(router.on_delete(Some(&a), notice).unwrap().delivered, 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_requires_joined_room() {
        let (router, _store) = memory_router();
        let (a, _rx_a) = connect(&router, "s-a");
        router.on_join(&a, "A", "C").await.unwrap();

        let notice = DeletionNotice {
            sender_id: "A".into(),
            receiver_id: "B".into(),
            message: "oops".into(),
            time: "10:01".into(),
            date: "2024-01-01".into(),
        };
        assert!(matches!(
            router.on_delete(Some(&a), notice),
            Err(RouterError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_errors_keep_session() {
        let (router, _store) = memory_router();
        let (a, _rx_a) = connect(&router, "s-a");

        assert!(matches!(
            router.on_join(&a, "A", "A").await,
            Err(RouterError::Validation(_))
        ));
        assert!(matches!(
            router.on_join(&a, "", "B").await,
            Err(RouterError::Validation(_))
        ));
        assert!(matches!(
            router.on_join(&SessionId::new("ghost"), "A", "B").await,
            Err(RouterError::UnknownSession(_))
        ));

        router.on_join(&a, "A", "B").await.unwrap();
        assert!(matches!(
            router.on_send(Some(&a), chat("M", "B", "spoof")).await,
            Err(RouterError::Validation(_))
        ));
        assert!(matches!(
            router.on_send(Some(&a), chat("A", "B", "")).await,
            Err(RouterError::Validation(_))
        ));

        // Still usable after the rejections.
        router.on_send(Some(&a), chat("A", "B", "fine")).await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_failure_is_surfaced() {
        let router = Router::new(Arc::new(FailingStore));
        let (a, _rx_a) = connect(&router, "s-a");

        // The join takes effect even though the backlog cannot be read.
        assert!(matches!(
            router.on_join(&a, "A", "B").await,
            Err(RouterError::StorageUnavailable(_))
        ));
        assert!(router.presence().is_online("A"));

        assert!(matches!(
            router.on_send(Some(&a), chat("A", "B", "hi")).await,
            Err(RouterError::StorageUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let config = RouterConfig {
            store_timeout: Duration::from_millis(500),
            ..RouterConfig::default()
        };
        let router = Router::with_config(Arc::new(StalledStore), config);

        let err = router.on_send(None, chat("A", "B", "hi")).await.unwrap_err();
        assert!(matches!(err, RouterError::StorageUnavailable(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_refused_backlog_stays_pending() {
        let (router, store) = memory_router();
        router.on_send(None, chat("A", "B", "hi")).await.unwrap();

        let id = SessionId::new("s-b");
        let (handle, mut rx) = SessionHandle::channel(id.clone(), 1);
        router.on_connect(handle.clone());
        handle.deliver(Delivery::Deleted(DeletionNotice {
            sender_id: "C".into(),
            receiver_id: "B".into(),
            message: "filler".into(),
            time: "09:00".into(),
            date: "2024-01-01".into(),
        }))
        .unwrap();

        assert!(matches!(
            router.on_join(&id, "B", "A").await,
            Err(RouterError::SessionGone(_))
        ));
        assert_eq!(store.pending_count(), 1);
        assert!(!store.messages_for("B").await.unwrap()[0].delivered);

        // Once the queue has room, the next join flushes the message.
        assert!(matches!(rx.try_recv(), Ok(Delivery::Deleted(_))));
        assert_eq!(router.on_join(&id, "B", "A").await.unwrap().backlog, 1);
        let Ok(Delivery::Backlog(messages)) = rx.try_recv() else {
            panic!("expected the backlog");
        };
        assert_eq!(messages[0].message, "hi");
        assert!(messages[0].delivered);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_read_timeout_keeps_messages() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(DetachedReadStore {
            inner: Arc::clone(&inner),
            delay: std::sync::Mutex::new(Duration::from_secs(5)),
        });
        let config = RouterConfig {
            store_timeout: Duration::from_millis(500),
            ..RouterConfig::default()
        };
        let router = Router::with_config(store.clone(), config);
        router.on_send(None, chat("A", "B", "hi")).await.unwrap();

        let (b, mut rx_b) = connect(&router, "s-b");
        assert!(matches!(
            router.on_join(&b, "B", "A").await,
            Err(RouterError::StorageUnavailable(_))
        ));

        // Let the detached read run to completion.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx_b.try_recv().is_err());
        assert_eq!(inner.pending_count(), 1);

        *store.delay.lock().unwrap() = Duration::ZERO;
        assert_eq!(router.on_join(&b, "B", "A").await.unwrap().backlog, 1);
        assert!(matches!(rx_b.try_recv(), Ok(Delivery::Backlog(m)) if m.len() == 1));
        assert_eq!(inner.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_large_backlog_is_split_in_order() {
        let store = Arc::new(MemoryStore::new());
        let config = RouterConfig {
            backlog_batch: 2,
            ..RouterConfig::default()
        };
        let router = Router::with_config(store.clone(), config);
        for i in 0..5 {
            router.on_send(None, chat("A", "B", &i.to_string())).await.unwrap();
        }

        let (b, mut rx_b) = connect(&router, "s-b");
        assert_eq!(router.on_join(&b, "B", "A").await.unwrap().backlog, 5);

        let mut sizes = Vec::new();
        let mut bodies = Vec::new();
        while let Ok(Delivery::Backlog(messages)) = rx_b.try_recv() {
            sizes.push(messages.len());
            bodies.extend(messages.into_iter().map(|m| m.message));
        }
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(bodies, ["0", "1", "2", "3", "4"]);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_batch_within_byte_budget() {
        let records: Vec<_> = (0..4)
            .map(|i| StoredMessage::pending(i, chat("A", "B", &"x".repeat(1000))))
            .collect();
        let one = encoded_size_hint(&records[0]);

        assert_eq!(batch_within(&records, usize::MAX), 4);
        assert_eq!(batch_within(&records, 2 * one), 2);
        // An oversized first record still goes out on its own.
        assert_eq!(batch_within(&records, 10), 1);
        assert_eq!(batch_within(&[], 10), 0);
    }
}
