//! Room directory for Parley.
//!
//! Rooms are named topics created by users. The directory owns room metadata,
//! the member list of every room, and each room's recent message history.
//! It does not enforce the one-room-per-user rule; the hub does.

use chrono::{DateTime, Utc};
use parley_protocol::{RoomDetails, RoomInfo, RoomSummary};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::message::ChatMessage;
use crate::{RoomId, UserId};

/// Maximum room name length in bytes.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Number of messages surfaced to a joining member.
pub const DEFAULT_RECENT_LIMIT: usize = 50;

/// Default number of messages retained per room.
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains control characters");
    }
    Ok(())
}

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidName(&'static str),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached ({0})")]
    RoomLimitReached(usize),
}

/// Room metadata. Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: UserId,
}

impl Room {
    /// Get the `rooms_list` entry for this room.
    #[must_use]
    pub fn summary(&self, user_count: usize) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            is_private: self.is_private,
            user_count,
        }
    }

    /// Get the `room_created` descriptor for this room.
    #[must_use]
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            is_private: self.is_private,
        }
    }

    /// Get the `room_joined` descriptor for this room.
    #[must_use]
    pub fn details(&self) -> RoomDetails {
        RoomDetails {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            is_private: self.is_private,
            created_at: self.created_at,
        }
    }
}

/// Directory configuration.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Messages retained per room; older ones are evicted.
    pub history_capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

struct RoomEntry {
    room: Room,
    /// Member user IDs in join order.
    members: Vec<UserId>,
    history: VecDeque<ChatMessage>,
}

/// The room directory.
#[derive(Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, RoomEntry>,
    /// Room IDs in creation order.
    order: Vec<RoomId>,
    config: DirectoryConfig,
}

impl RoomDirectory {
    /// Create a new directory with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new directory with custom configuration.
    #[must_use]
    pub fn with_config(config: DirectoryConfig) -> Self {
        Self {
            rooms: HashMap::new(),
            order: Vec::new(),
            config,
        }
    }

    /// Create a room with a fresh ID, no members and no history.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the room limit is reached.
    pub fn create_room(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        is_private: bool,
        created_by: &str,
    ) -> Result<Room, DirectoryError> {
        let name = name.into();
        validate_room_name(&name).map_err(DirectoryError::InvalidName)?;

        if self.rooms.len() >= self.config.max_rooms {
            return Err(DirectoryError::RoomLimitReached(self.config.max_rooms));
        }

        let room = Room {
            id: Uuid::new_v4().to_string(),
            name,
            description: description.into(),
            is_private,
            created_at: Utc::now(),
            created_by: created_by.to_string(),
        };

        debug!(room = %room.id, name = %room.name, creator = %created_by, "Created room");

        self.order.push(room.id.clone());
        self.rooms.insert(
            room.id.clone(),
            RoomEntry {
                room: room.clone(),
                members: Vec::new(),
                history: VecDeque::new(),
            },
        );

        Ok(room)
    }

    /// List rooms with their member counts, in creation order.
    #[must_use]
    pub fn list_rooms(&self) -> Vec<(&Room, usize)> {
        self.order
            .iter()
            .filter_map(|id| self.rooms.get(id))
            .map(|entry| (&entry.room, entry.members.len()))
            .collect()
    }

    /// Get a room by ID.
    #[must_use]
    pub fn get_room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id).map(|entry| &entry.room)
    }

    /// Add a member to a room.
    ///
    /// Returns `true` if the user was added, `false` if already a member or
    /// the room does not exist.
    pub fn add_member(&mut self, room_id: &str, user_id: &str) -> bool {
        let Some(entry) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.members.iter().any(|m| m == user_id) {
            return false;
        }
        entry.members.push(user_id.to_string());
        trace!(room = %room_id, user = %user_id, members = entry.members.len(), "Member added");
        true
    }

    /// Remove a member from a room.
    ///
    /// Returns `true` if the user was a member.
    pub fn remove_member(&mut self, room_id: &str, user_id: &str) -> bool {
        let Some(entry) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let before = entry.members.len();
        entry.members.retain(|m| m != user_id);
        let removed = entry.members.len() != before;
        if removed {
            trace!(room = %room_id, user = %user_id, members = entry.members.len(), "Member removed");
        }
        removed
    }

    /// Get the members of a room in join order.
    #[must_use]
    pub fn members(&self, room_id: &str) -> &[UserId] {
        self.rooms
            .get(room_id)
            .map(|entry| entry.members.as_slice())
            .unwrap_or_default()
    }

    /// Check if a user is a member of a room.
    #[must_use]
    pub fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.members(room_id).iter().any(|m| m == user_id)
    }

    /// Append a message to its room's history, evicting the oldest entry
    /// once the history is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the message's room does not exist.
    pub fn append_message(&mut self, message: ChatMessage) -> Result<(), DirectoryError> {
        let capacity = self.config.history_capacity.max(1);
        let entry = self
            .rooms
            .get_mut(&message.room_id)
            .ok_or_else(|| DirectoryError::RoomNotFound(message.room_id.clone()))?;

        if entry.history.len() >= capacity {
            entry.history.pop_front();
        }
        entry.history.push_back(message);
        Ok(())
    }

    /// Get up to `limit` most recent messages of a room, oldest first.
    #[must_use]
    pub fn recent_messages(&self, room_id: &str, limit: usize) -> Vec<&ChatMessage> {
        let Some(entry) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        let skip = entry.history.len().saturating_sub(limit);
        entry.history.iter().skip(skip).collect()
    }

    /// Get the number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Check if there are no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with_room() -> (RoomDirectory, RoomId) {
        let mut directory = RoomDirectory::new();
        let room = directory.create_room("general", "", false, "alice").unwrap();
        (directory, room.id)
    }

    #[test]
    fn test_empty_directory_lists_nothing() {
        let directory = RoomDirectory::new();
        assert!(directory.list_rooms().is_empty());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_create_room() {
        let mut directory = RoomDirectory::new();
        let room = directory
            .create_room("general", "chit-chat", true, "alice")
            .unwrap();

        assert_eq!(room.name, "general");
        assert_eq!(room.description, "chit-chat");
        assert!(room.is_private);
        assert_eq!(room.created_by, "alice");
        assert_eq!(directory.get_room(&room.id), Some(&room));
        assert!(directory.members(&room.id).is_empty());
        assert!(directory.recent_messages(&room.id, 50).is_empty());
    }

    #[test]
    fn test_room_ids_are_unique() {
        let mut directory = RoomDirectory::new();
        let a = directory.create_room("same", "", false, "u").unwrap();
        let b = directory.create_room("same", "", false, "u").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_list_rooms_in_creation_order() {
        let mut directory = RoomDirectory::new();
        let names = ["zeta", "alpha", "mid"];
        for name in names {
            directory.create_room(name, "", false, "u").unwrap();
        }
        let first = directory.list_rooms()[0].0.id.clone();
        directory.add_member(&first, "bob");

        let listed: Vec<_> = directory
            .list_rooms()
            .into_iter()
            .map(|(room, count)| (room.name.clone(), count))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("zeta".to_string(), 1),
                ("alpha".to_string(), 0),
                ("mid".to_string(), 0)
            ]
        );
    }

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("general").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("   ").is_err());
        assert!(validate_room_name("bad\nname").is_err());
        assert!(validate_room_name(&"a".repeat(MAX_ROOM_NAME_LENGTH + 1)).is_err());

        let mut directory = RoomDirectory::new();
        assert!(matches!(
            directory.create_room("", "", false, "u"),
            Err(DirectoryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_room_limit() {
        let mut directory = RoomDirectory::with_config(DirectoryConfig {
            max_rooms: 1,
            ..Default::default()
        });
        directory.create_room("one", "", false, "u").unwrap();
        assert!(matches!(
            directory.create_room("two", "", false, "u"),
            Err(DirectoryError::RoomLimitReached(1))
        ));
    }

    #[test]
    fn test_membership_is_idempotent() {
        let (mut directory, room) = directory_with_room();

        assert!(directory.add_member(&room, "alice"));
        assert!(!directory.add_member(&room, "alice"));
        assert!(directory.add_member(&room, "bob"));
        assert_eq!(directory.members(&room), ["alice", "bob"]);

        assert!(directory.remove_member(&room, "alice"));
        assert!(!directory.remove_member(&room, "alice"));
        assert_eq!(directory.members(&room), ["bob"]);
        assert!(!directory.is_member(&room, "alice"));
    }

    #[test]
    fn test_membership_on_unknown_room() {
        let mut directory = RoomDirectory::new();
        assert!(!directory.add_member("missing", "alice"));
        assert!(!directory.remove_member("missing", "alice"));
        assert!(directory.members("missing").is_empty());
    }

    #[test]
    fn test_recent_messages_window() {
        let (mut directory, room) = directory_with_room();
        for i in 1..=200 {
            directory
                .append_message(ChatMessage::new(room.clone(), "alice", "alice", i.to_string()))
                .unwrap();
        }

        let recent = directory.recent_messages(&room, DEFAULT_RECENT_LIMIT);
        assert_eq!(recent.len(), 50);
        assert_eq!(recent.first().unwrap().content, "151");
        assert_eq!(recent.last().unwrap().content, "200");

        let few = directory.recent_messages(&room, 3);
        let contents: Vec<_> = few.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["198", "199", "200"]);
    }

    #[test]
    fn test_recent_messages_fewer_than_limit() {
        let (mut directory, room) = directory_with_room();
        for i in 0..5 {
            directory
                .append_message(ChatMessage::new(room.clone(), "u", "u", i.to_string()))
                .unwrap();
        }
        assert_eq!(directory.recent_messages(&room, 50).len(), 5);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut directory = RoomDirectory::with_config(DirectoryConfig {
            history_capacity: 10,
            ..Default::default()
        });
        let room = directory.create_room("r", "", false, "u").unwrap().id;
        for i in 0..25 {
            directory
                .append_message(ChatMessage::new(room.clone(), "u", "u", i.to_string()))
                .unwrap();
        }

        let all = directory.recent_messages(&room, 100);
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].content, "15");
    }

    #[test]
    fn test_append_to_unknown_room() {
        let mut directory = RoomDirectory::new();
        let result = directory.append_message(ChatMessage::new("missing", "u", "u", "x"));
        assert!(matches!(result, Err(DirectoryError::RoomNotFound(_))));
    }
}
