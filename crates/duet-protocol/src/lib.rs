//! # duet-protocol
//!
//! Wire protocol definitions for the Duet one-to-one chat relay.
//!
//! This crate defines the events exchanged between chat clients and the
//! relay server, the chat records they carry, and the codecs used to put
//! them on a WebSocket.
//!
//! ## Events
//!
//! - `join` - Pair the connection with a peer and flush its backlog
//! - `send_message` / `receive_message` - Live one-to-one messages
//! - `receive_backlog` - Messages stored while the receiver was offline
//! - `delete_message` / `message_deleted` - Best-effort deletion notices
//! - `ack` / `error` - Outcome of a request carrying an `id`
//!
//! ## Example
//!
//! ```rust
//! use duet_protocol::{codec, ChatMessage, Frame};
//!
//! let msg = ChatMessage::new("alice", "bob", "hi", "text", "10:00", "2024-01-01");
//! let frame = Frame::send_message(Some(7), msg);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod payload;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{codes, AckStatus, Frame, PROTOCOL_VERSION};
pub use payload::{ChatMessage, DeletionNotice, MessageId, StoredMessage};
