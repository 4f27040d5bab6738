//! # Duet Server
//!
//! WebSocket relay for one-to-one chat. A message goes straight to the
//! receiver when they have a live session in the shared room, and into the
//! message store otherwise; stored messages are flushed the next time the
//! receiver joins.
//!
//! The binary in `main.rs` wires configuration, tracing and metrics around
//! [`handlers::run_server`]; tests drive [`handlers::serve`] directly.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
