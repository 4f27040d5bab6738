//! Chat records carried inside frames.
//!
//! Field names follow the client wire format (`senderId`, `receiverId`, ...).
//! `time` and `date` are supplied by the client and never interpreted here.

use serde::{Deserialize, Serialize};

/// Store-assigned message identifier, monotonically increasing per store.
pub type MessageId = u64;

/// A chat message as submitted by its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Identity of the sender.
    pub sender_id: String,
    /// Identity of the receiver.
    pub receiver_id: String,
    /// Message body.
    pub message: String,
    /// Content kind tag (`text`, `image`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Client-supplied time string.
    pub time: String,
    /// Client-supplied date string.
    pub date: String,
}

impl ChatMessage {
    /// Create a new chat message.
    #[must_use]
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        message: impl Into<String>,
        kind: impl Into<String>,
        time: impl Into<String>,
        date: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            message: message.into(),
            kind: kind.into(),
            time: time.into(),
            date: date.into(),
        }
    }
}

/// A message persisted because its receiver was offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Store-assigned identifier.
    pub id: MessageId,
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub time: String,
    pub date: String,
    /// Whether the message has been handed to the receiver.
    #[serde(default)]
    pub delivered: bool,
}

impl StoredMessage {
    /// Wrap a chat message as a new, undelivered record.
    #[must_use]
    pub fn pending(id: MessageId, message: ChatMessage) -> Self {
        Self {
            id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            message: message.message,
            kind: message.kind,
            time: message.time,
            date: message.date,
            delivered: false,
        }
    }

    /// The chat message this record was created from.
    #[must_use]
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            message: self.message.clone(),
            kind: self.kind.clone(),
            time: self.time.clone(),
            date: self.date.clone(),
        }
    }
}

/// Notice that the sender deleted a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionNotice {
    pub sender_id: String,
    pub receiver_id: String,
    /// Body of the deleted message, used by clients to locate it.
    pub message: String,
    pub time: String,
    pub date: String,
}
