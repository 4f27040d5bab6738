//! Validation of chat payloads entering the router.
//!
//! Every text field of a message is required; the router rejects a payload
//! before it can reach a room or the store.

use crate::room::validate_user_id;
use duet_protocol::{ChatMessage, DeletionNotice};

/// Default maximum message body length in bytes.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 16 * 1024;

/// Maximum length of the `type`, `time` and `date` fields.
const MAX_TAG_LENGTH: usize = 64;

fn validate_pair(sender: &str, receiver: &str) -> Result<(), &'static str> {
    validate_user_id(sender)?;
    validate_user_id(receiver)?;
    if sender == receiver {
        return Err("Sender and receiver must differ");
    }
    Ok(())
}

fn validate_tag(value: &str, empty: &'static str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err(empty);
    }
    if value.len() > MAX_TAG_LENGTH {
        return Err("Field too long");
    }
    Ok(())
}

/// Validate a chat message.
///
/// # Errors
///
/// Returns an error message naming the first invalid field.
pub fn validate_chat(message: &ChatMessage, max_len: usize) -> Result<(), &'static str> {
    validate_pair(&message.sender_id, &message.receiver_id)?;
    if message.message.is_empty() {
        return Err("Message cannot be empty");
    }
    if message.message.len() > max_len {
        return Err("Message too long");
    }
    validate_tag(&message.kind, "Message type cannot be empty")?;
    validate_tag(&message.time, "Message time cannot be empty")?;
    validate_tag(&message.date, "Message date cannot be empty")
}

/// Validate a deletion notice.
///
/// # Errors
///
/// Returns an error message naming the first invalid field.
pub fn validate_deletion(notice: &DeletionNotice, max_len: usize) -> Result<(), &'static str> {
    validate_pair(&notice.sender_id, &notice.receiver_id)?;
    if notice.message.is_empty() {
        return Err("Message cannot be empty");
    }
    if notice.message.len() > max_len {
        return Err("Message too long");
    }
    validate_tag(&notice.time, "Message time cannot be empty")?;
    validate_tag(&notice.date, "Message date cannot be empty")
}
