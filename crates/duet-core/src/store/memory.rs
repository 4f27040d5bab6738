//! Embedded in-process store.

use super::{MessageStore, StoreError};
use crate::room::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use duet_protocol::{ChatMessage, MessageId, StoredMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Records addressed to one receiver, sorted by id.
///
/// Everything before `first_pending` is delivered.
#[derive(Debug, Default)]
struct Inbox {
    records: Vec<StoredMessage>,
    first_pending: usize,
}

impl Inbox {
    fn pending(&self) -> impl Iterator<Item = &StoredMessage> {
        self.records[self.first_pending..]
            .iter()
            .filter(|record| !record.delivered)
    }

    fn mark(&mut self, id: MessageId) -> bool {
        match self.records.binary_search_by_key(&id, |record| record.id) {
            Ok(index) if !self.records[index].delivered => {
                self.records[index].delivered = true;
                true
            }
            _ => false,
        }
    }

    fn advance(&mut self) {
        while self
            .records
            .get(self.first_pending)
            .is_some_and(|record| record.delivered)
        {
            self.first_pending += 1;
        }
    }
}

/// In-memory [`MessageStore`].
///
/// Each receiver's inbox is guarded by its map entry lock, which makes
/// drain-and-mark a single critical section per receiver.
///
/// Delivered records are kept for [`MessageStore::messages_for`] until the
/// process exits, so memory grows with total traffic. Use the sled backend
/// where history has to be retained or pruned externally.
#[derive(Debug)]
pub struct MemoryStore {
    inboxes: DashMap<UserId, Inbox>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of undelivered messages across all receivers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inboxes
            .iter()
            .map(|inbox| inbox.pending().count())
            .sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, message: ChatMessage) -> Result<StoredMessage, StoreError> {
        let mut inbox = self.inboxes.entry(message.receiver_id.clone()).or_default();
        // Allocated under the entry lock so ids follow inbox order.
        let id: MessageId = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = StoredMessage::pending(id, message);
        inbox.records.push(record.clone());
        trace!(receiver = %record.receiver_id, id, "Stored message");
        Ok(record)
    }

    async fn pending_for(
        &self,
        receiver: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .inboxes
            .get(receiver)
            .map(|inbox| inbox.pending().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_delivered(
        &self,
        receiver: &str,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, StoreError> {
        let Some(mut inbox) = self.inboxes.get_mut(receiver) else {
            return Ok(Vec::new());
        };
        let claimed: Vec<MessageId> = ids.iter().copied().filter(|&id| inbox.mark(id)).collect();
        inbox.advance();
        Ok(claimed)
    }

    async fn drain_undelivered(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let Some(mut inbox) = self.inboxes.get_mut(receiver) else {
            return Ok(Vec::new());
        };

        let start = inbox.first_pending;
        let drained: Vec<StoredMessage> = inbox.records[start..]
            .iter_mut()
            .filter(|record| !record.delivered)
            .map(|record| {
                record.delivered = true;
                record.clone()
            })
            .collect();
        inbox.first_pending = inbox.records.len();
        Ok(drained)
    }

    async fn messages_for(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .inboxes
            .get(receiver)
            .map(|inbox| inbox.records.clone())
            .unwrap_or_default())
    }
}
