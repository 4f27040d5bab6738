//! # duet-core
//!
//! Presence-aware message routing with store-and-forward delivery for the
//! Duet one-to-one chat relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Room** - Canonical room ids for an unordered pair of users
//! - **Presence** - Index of which users have live sessions
//! - **Lifecycle** - Session table across connect, join and disconnect
//! - **Store** - Backlog of messages for offline receivers
//! - **Router** - The decision point between live delivery and storage
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│    Room     │──▶ SessionHandle
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │
//!                        ▼       ▼
//!               ┌──────────┐   ┌──────────────┐
//!               │ Presence │   │ MessageStore │
//!               └──────────┘   └──────────────┘
//! ```
//!
//! The router never touches a transport. It pushes [`Delivery`] commands into
//! the bounded queue behind each [`SessionHandle`]; the connection task that
//! owns the queue writes them to the socket.

pub mod lifecycle;
pub mod message;
pub mod presence;
pub mod room;
pub mod router;
pub mod session;
pub mod store;

pub use duet_protocol::{ChatMessage, DeletionNotice, MessageId, StoredMessage};
pub use lifecycle::{ConnectionManager, SessionState};
pub use presence::PresenceRegistry;
pub use room::{resolve_room, validate_user_id, Room, RoomId, UserId};
pub use router::{
    Fanout, JoinOutcome, Router, RouterConfig, RouterError, RouterStats, SendOutcome,
};
pub use session::{Delivery, SessionGone, SessionHandle, SessionId};
pub use store::{MemoryStore, MessageStore, SledStore, StoreError};
