//! Event types for the Parley protocol.
//!
//! Inbound and outbound events are closed tagged unions: the `type` field of
//! the JSON object names the variant, and each variant lists exactly the
//! fields it needs. Field names follow the browser client (`userId`,
//! `roomId`, `userCount`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-width RFC 3339 timestamps (UTC, microseconds), so that the text
/// sorts in time order.
mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

/// An event sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind this connection to a user identity.
    UserConnect {
        /// Client-chosen user identifier.
        #[serde(rename = "userId")]
        user_id: String,
        /// Display name.
        username: String,
    },

    /// Ask for the current room list.
    GetRooms,

    /// Create a new room.
    CreateRoom {
        /// Room name.
        name: String,
        /// Optional room description.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Whether the room is private.
        #[serde(default, rename = "private", skip_serializing_if = "Option::is_none")]
        is_private: Option<bool>,
    },

    /// Join a room, leaving the current one if any.
    JoinRoom {
        /// Room to join.
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Leave the current room.
    LeaveRoom,

    /// Post a message to the current room.
    SendMessage {
        /// Message text.
        #[serde(rename = "message")]
        content: String,
    },

    /// Change the display name.
    UpdateUsername {
        /// New display name.
        username: String,
    },
}

impl ClientEvent {
    /// Get the wire name of this event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::UserConnect { .. } => "user_connect",
            ClientEvent::GetRooms => "get_rooms",
            ClientEvent::CreateRoom { .. } => "create_room",
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::LeaveRoom => "leave_room",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::UpdateUsername { .. } => "update_username",
        }
    }

    /// Create a new UserConnect event.
    #[must_use]
    pub fn user_connect(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        ClientEvent::UserConnect {
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    /// Create a new CreateRoom event with no description.
    #[must_use]
    pub fn create_room(name: impl Into<String>, is_private: bool) -> Self {
        ClientEvent::CreateRoom {
            name: name.into(),
            description: None,
            is_private: Some(is_private),
        }
    }

    /// Create a new JoinRoom event.
    #[must_use]
    pub fn join_room(room_id: impl Into<String>) -> Self {
        ClientEvent::JoinRoom {
            room_id: room_id.into(),
        }
    }

    /// Create a new SendMessage event.
    #[must_use]
    pub fn send_message(content: impl Into<String>) -> Self {
        ClientEvent::SendMessage {
            content: content.into(),
        }
    }

    /// Create a new UpdateUsername event.
    #[must_use]
    pub fn update_username(username: impl Into<String>) -> Self {
        ClientEvent::UpdateUsername {
            username: username.into(),
        }
    }
}

/// Room entry in a `rooms_list` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "private")]
    pub is_private: bool,
    /// Number of current members.
    #[serde(rename = "userCount")]
    pub user_count: usize,
}

/// Room descriptor in a `room_created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "private")]
    pub is_private: bool,
}

/// Room descriptor in a `room_joined` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDetails {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "private")]
    pub is_private: bool,
    #[serde(serialize_with = "timestamp::serialize")]
    pub created_at: DateTime<Utc>,
}

/// A chat message as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Display name of the author at send time.
    pub username: String,
    pub content: String,
    #[serde(serialize_with = "timestamp::serialize")]
    pub timestamp: DateTime<Utc>,
}

/// An event sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// All rooms with their member counts.
    RoomsList { rooms: Vec<RoomSummary> },

    /// A room was created by the recipient.
    RoomCreated { room: RoomInfo },

    /// Snapshot sent to a user who just joined a room.
    RoomJoined {
        room: RoomDetails,
        /// Recent history, oldest first.
        messages: Vec<MessageView>,
        /// Member display names.
        users: Vec<String>,
    },

    /// Another user joined the recipient's room.
    UserJoined { username: String, users: Vec<String> },

    /// The recipient left its room.
    RoomLeft,

    /// Another user left the recipient's room.
    UserLeft { username: String, users: Vec<String> },

    /// A message was posted to the recipient's room.
    NewMessage { message: MessageView },

    /// Another member of the recipient's room changed display name.
    UserRenamed {
        #[serde(rename = "oldUsername")]
        old_username: String,
        username: String,
        users: Vec<String>,
    },
}

impl ServerEvent {
    /// Get the wire name of this event kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::RoomsList { .. } => "rooms_list",
            ServerEvent::RoomCreated { .. } => "room_created",
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::RoomLeft => "room_left",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::UserRenamed { .. } => "user_renamed",
        }
    }
}
