//! Chat message types for Parley.

use chrono::{DateTime, Utc};
use parley_protocol::MessageView;
use uuid::Uuid;

use crate::{RoomId, UserId};

/// A unique message identifier.
pub type MessageId = String;

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    Uuid::new_v4().to_string()
}

/// A message posted to a room.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Unique message identifier.
    pub id: MessageId,
    /// Room the message was posted to.
    pub room_id: RoomId,
    /// Author.
    pub user_id: UserId,
    /// Author's display name when the message was sent. Not updated on rename.
    pub display_name: String,
    /// Message text.
    pub content: String,
    /// When the hub accepted the message.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new message stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the client-facing view of this message.
    #[must_use]
    pub fn to_view(&self) -> MessageView {
        MessageView {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            username: self.display_name.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
        }
    }
}
