//! Frame types for the Duet protocol.
//!
//! Every frame is a JSON-shaped map tagged by its `event` name, so the same
//! definitions serve both the MessagePack and the JSON codec.

use serde::{Deserialize, Serialize};

use crate::payload::{ChatMessage, DeletionNotice, StoredMessage};

/// Protocol version advertised in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by `error` frames.
pub mod codes {
    /// The frame could not be decoded or exceeded the size limit.
    pub const MALFORMED: u16 = 1001;
    /// The frame decoded but its content was rejected.
    pub const VALIDATION: u16 = 1002;
    /// The store failed; the message may or may not have been kept.
    pub const STORAGE_UNAVAILABLE: u16 = 1003;
    /// Unexpected server-side failure.
    pub const INTERNAL: u16 = 1004;
}

/// Outcome reported by an `ack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The join took effect.
    Joined,
    /// The message was handed to the receiver's live sessions.
    Delivered,
    /// The receiver was offline; the message was stored for later.
    Stored,
    /// The deletion notice was broadcast.
    Deleted,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Frame {
    /// Pair this connection with a peer.
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        user_id: String,
        target_user_id: String,
    },

    /// Send a message to the peer.
    #[serde(rename = "send_message")]
    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(flatten)]
        message: ChatMessage,
    },

    /// Delete a previously sent message.
    #[serde(rename = "delete_message")]
    DeleteMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(flatten)]
        notice: DeletionNotice,
    },

    /// A live message pushed to a room session.
    #[serde(rename = "receive_message")]
    ReceiveMessage {
        #[serde(flatten)]
        message: ChatMessage,
    },

    /// Messages stored while the receiver was offline, in send order.
    #[serde(rename = "receive_backlog")]
    ReceiveBacklog { messages: Vec<StoredMessage> },

    /// A deletion notice pushed to a room session.
    #[serde(rename = "message_deleted")]
    MessageDeleted {
        #[serde(flatten)]
        notice: DeletionNotice,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack { id: u64, status: AckStatus },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection established response.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        session_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// The event name this frame is tagged with.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::SendMessage { .. } => "send_message",
            Frame::DeleteMessage { .. } => "delete_message",
            Frame::ReceiveMessage { .. } => "receive_message",
            Frame::ReceiveBacklog { .. } => "receive_backlog",
            Frame::MessageDeleted { .. } => "message_deleted",
            Frame::Ack { .. } => "ack",
            Frame::Error { .. } => "error",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Connected { .. } => "connected",
        }
    }

    /// Request ID carried by the frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Join { id, .. }
            | Frame::SendMessage { id, .. }
            | Frame::DeleteMessage { id, .. } => *id,
            Frame::Ack { id, .. } | Frame::Error { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: Option<u64>, user_id: impl Into<String>, target: impl Into<String>) -> Self {
        Frame::Join {
            id,
            user_id: user_id.into(),
            target_user_id: target.into(),
        }
    }

    /// Create a new SendMessage frame.
    #[must_use]
    pub fn send_message(id: Option<u64>, message: ChatMessage) -> Self {
        Frame::SendMessage { id, message }
    }

    /// Create a new DeleteMessage frame.
    #[must_use]
    pub fn delete_message(id: Option<u64>, notice: DeletionNotice) -> Self {
        Frame::DeleteMessage { id, notice }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64, status: AckStatus) -> Self {
        Frame::Ack { id, status }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(session_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            session_id: session_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }
}
