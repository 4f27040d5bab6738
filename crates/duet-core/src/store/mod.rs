//! Backlog storage for messages addressed to offline receivers.
//!
//! A store only ever appends records and flips their `delivered` flag;
//! retention is left to whoever operates the backing storage.

mod durable;
mod memory;

pub use durable::SledStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use duet_protocol::{ChatMessage, MessageId, StoredMessage};
use std::collections::HashSet;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing storage could not be reached or failed an operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Durable record of messages waiting for their receiver.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Short name of the backend, for logs.
    fn name(&self) -> &'static str;

    /// Append a message as undelivered and return the stored record.
    async fn enqueue(&self, message: ChatMessage) -> Result<StoredMessage, StoreError>;

    /// Up to `limit` undelivered messages for a receiver, in insertion
    /// order. Nothing is marked; a record that cannot be read is skipped.
    async fn pending_for(
        &self,
        receiver: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Mark the given records of a receiver delivered and return the ids
    /// this call moved out of the pending set.
    ///
    /// The claim is atomic per call: either every listed id that is still
    /// pending is claimed, or none is. Ids already delivered are left out of
    /// the result, so concurrent callers never claim the same record.
    async fn mark_delivered(
        &self,
        receiver: &str,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, StoreError>;

    /// Take every undelivered message for a receiver, in insertion order,
    /// and mark them delivered.
    ///
    /// Concurrent drains for the same receiver never return the same
    /// message twice, and a drained message is never returned again.
    async fn drain_undelivered(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let pending = self.pending_for(receiver, usize::MAX).await?;
        if pending.is_empty() {
            return Ok(pending);
        }
        let ids: Vec<MessageId> = pending.iter().map(|m| m.id).collect();
        let claimed: HashSet<MessageId> =
            self.mark_delivered(receiver, &ids).await?.into_iter().collect();
        Ok(pending
            .into_iter()
            .filter(|m| claimed.contains(&m.id))
            .map(|mut m| {
                m.delivered = true;
                m
            })
            .collect())
    }

    /// Every retained message for a receiver, delivered or not, in
    /// insertion order.
    async fn messages_for(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError>;
}
