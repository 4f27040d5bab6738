//! Durable store backed by an embedded sled database.
//!
//! Layout:
//! - `messages`: big-endian id -> JSON record
//! - `inbox`: receiver `\0` id -> () for every record of a receiver
//! - `pending`: receiver `\0` id -> () for undelivered records only
//!
//! Reading the backlog touches only `pending` and `messages`. Marking a
//! batch delivered removes its pending keys and rewrites its records in one
//! transaction; a key already gone was claimed by someone else, so
//! concurrent claims partition the backlog.

use super::{MessageStore, StoreError};
use async_trait::async_trait;
use duet_protocol::{ChatMessage, MessageId, StoredMessage};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::path::Path;
use tracing::{debug, info, warn};

const ID_LEN: usize = std::mem::size_of::<MessageId>();

fn receiver_prefix(receiver: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(receiver.len() + 1 + ID_LEN);
    key.extend_from_slice(receiver.as_bytes());
    key.push(0);
    key
}

fn receiver_key(receiver: &str, id: MessageId) -> Vec<u8> {
    let mut key = receiver_prefix(receiver);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn id_suffix(key: &[u8]) -> Option<&[u8]> {
    key.len().checked_sub(ID_LEN).map(|start| &key[start..])
}

/// [`MessageStore`] persisted with sled.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    messages: sled::Tree,
    inbox: sled::Tree,
    pending: sled::Tree,
}

impl SledStore {
    /// Open or create a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!(path = %path.display(), "Opened sled message store");
        Self::from_db(db)
    }

    /// Open a throwaway store that is deleted when dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            messages: db.open_tree("messages")?,
            inbox: db.open_tree("inbox")?,
            pending: db.open_tree("pending")?,
            db,
        })
    }

    fn enqueue_blocking(&self, message: ChatMessage) -> Result<StoredMessage, StoreError> {
        let id = self.db.generate_id()?;
        let record = StoredMessage::pending(id, message);
        let value = serde_json::to_vec(&record)?;
        let id_key = id.to_be_bytes();
        let receiver_key = receiver_key(&record.receiver_id, id);
        let marker: &[u8] = &[];

        (&self.messages, &self.inbox, &self.pending)
            .transaction(|(messages, inbox, pending)| {
                messages.insert(&id_key[..], value.as_slice())?;
                inbox.insert(receiver_key.as_slice(), marker)?;
                pending.insert(receiver_key.as_slice(), marker)?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|err| match err {
                TransactionError::Storage(err) => StoreError::from(err),
                TransactionError::Abort(()) => {
                    StoreError::Unavailable("enqueue transaction aborted".to_string())
                }
            })?;

        self.db.flush()?;
        debug!(receiver = %record.receiver_id, id, "Persisted message");
        Ok(record)
    }

    fn decode(id_key: &[u8], raw: &[u8]) -> Option<StoredMessage> {
        match serde_json::from_slice(raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(key = ?id_key, error = %err, "Skipping undecodable message record");
                None
            }
        }
    }

    fn pending_blocking(
        &self,
        receiver: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut pending = Vec::new();

        for entry in self.pending.scan_prefix(receiver_prefix(receiver)) {
            if pending.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            let Some(id_key) = id_suffix(&key) else {
                continue;
            };
            let Some(raw) = self.messages.get(id_key)? else {
                warn!(receiver = %receiver, "Pending key without a message record");
                continue;
            };
            if let Some(record) = Self::decode(id_key, &raw) {
                pending.push(record);
            }
        }

        Ok(pending)
    }

    fn mark_blocking(
        &self,
        receiver: &str,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, StoreError> {
        let claimed = (&self.pending, &self.messages)
            .transaction(|(pending, messages)| {
                let mut claimed = Vec::with_capacity(ids.len());
                for &id in ids {
                    if pending.remove(receiver_key(receiver, id))?.is_none() {
                        continue;
                    }
                    claimed.push(id);

                    let id_key = id.to_be_bytes();
                    let Some(raw) = messages.get(id_key)? else {
                        continue;
                    };
                    let Some(mut record) = Self::decode(&id_key, &raw) else {
                        continue;
                    };
                    record.delivered = true;
                    let value = serde_json::to_vec(&record)
                        .map_err(|err| ConflictableTransactionError::Abort(StoreError::from(err)))?;
                    messages.insert(&id_key[..], value)?;
                }
                Ok(claimed)
            })
            .map_err(|err| match err {
                TransactionError::Storage(err) => StoreError::from(err),
                TransactionError::Abort(err) => err,
            })?;

        if !claimed.is_empty() {
            self.db.flush()?;
            debug!(receiver = %receiver, count = claimed.len(), "Marked messages delivered");
        }
        Ok(claimed)
    }

    fn history_blocking(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mut history = Vec::new();
        for entry in self.inbox.scan_prefix(receiver_prefix(receiver)) {
            let (key, _) = entry?;
            let Some(id_key) = id_suffix(&key) else {
                continue;
            };
            if let Some(raw) = self.messages.get(id_key)? {
                history.extend(Self::decode(id_key, &raw));
            }
        }
        Ok(history)
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(SledStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(store))
            .await
            .map_err(|err| StoreError::Unavailable(format!("store task failed: {err}")))?
    }
}

#[async_trait]
impl MessageStore for SledStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn enqueue(&self, message: ChatMessage) -> Result<StoredMessage, StoreError> {
        self.run_blocking(move |store| store.enqueue_blocking(message))
            .await
    }

    async fn pending_for(
        &self,
        receiver: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let receiver = receiver.to_string();
        self.run_blocking(move |store| store.pending_blocking(&receiver, limit))
            .await
    }

    async fn mark_delivered(
        &self,
        receiver: &str,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, StoreError> {
        let receiver = receiver.to_string();
        let ids = ids.to_vec();
        self.run_blocking(move |store| store.mark_blocking(&receiver, &ids))
            .await
    }

    async fn messages_for(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let receiver = receiver.to_string();
        self.run_blocking(move |store| store.history_blocking(&receiver))
            .await
    }
}
