//! Presence tracking for Parley.
//!
//! Presence holds one record per connected user: the display name, the room
//! the user is in (if any), and the connection that owns the record.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::registry::ConnectionId;
use crate::{RoomId, UserId};

/// Presence record for a single user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// Client-supplied user ID.
    pub user_id: UserId,
    /// Display name.
    pub display_name: String,
    /// Room the user is currently in.
    pub current_room: Option<RoomId>,
    /// Connection that owns this record.
    pub connection_id: ConnectionId,
    /// When the user connected.
    pub connected_at: DateTime<Utc>,
}

impl UserRecord {
    /// Create a new, room-less record.
    #[must_use]
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            current_room: None,
            connection_id,
            connected_at: Utc::now(),
        }
    }

    /// Check if this record belongs to the given connection.
    #[must_use]
    pub fn is_owned_by(&self, connection_id: &ConnectionId) -> bool {
        &self.connection_id == connection_id
    }
}

/// Presence store for all connected users.
#[derive(Debug, Default)]
pub struct PresenceStore {
    users: HashMap<UserId, UserRecord>,
}

impl PresenceStore {
    /// Create a new presence store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the record for a user with a fresh, room-less one.
    ///
    /// Severing the old record's room membership is the caller's job.
    pub fn on_connect(
        &mut self,
        user_id: &str,
        display_name: impl Into<String>,
        connection_id: ConnectionId,
    ) -> &UserRecord {
        let record = UserRecord::new(user_id, display_name, connection_id);
        if self.users.insert(user_id.to_string(), record).is_some() {
            debug!(user = %user_id, "Presence: record replaced");
        } else {
            debug!(user = %user_id, "Presence: user connected");
        }
        &self.users[user_id]
    }

    /// Change a user's display name.
    ///
    /// Returns the previous name, or `None` if the user is unknown.
    pub fn set_display_name(&mut self, user_id: &str, name: impl Into<String>) -> Option<String> {
        let record = self.users.get_mut(user_id)?;
        Some(std::mem::replace(&mut record.display_name, name.into()))
    }

    /// Set or clear a user's current room.
    ///
    /// Returns `true` if the user exists.
    pub fn set_current_room(&mut self, user_id: &str, room_id: Option<RoomId>) -> bool {
        match self.users.get_mut(user_id) {
            Some(record) => {
                record.current_room = room_id;
                true
            }
            None => false,
        }
    }

    /// Get the record for a user.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<&UserRecord> {
        self.users.get(user_id)
    }

    /// Remove a user's record.
    ///
    /// Returns the removed record, if any.
    pub fn remove(&mut self, user_id: &str) -> Option<UserRecord> {
        let record = self.users.remove(user_id);
        if record.is_some() {
            debug!(user = %user_id, "Presence: user removed");
        }
        record
    }

    /// Resolve user IDs to display names, skipping users no longer present.
    #[must_use]
    pub fn resolve_names<'a>(&self, user_ids: impl IntoIterator<Item = &'a UserId>) -> Vec<String> {
        user_ids
            .into_iter()
            .filter_map(|id| self.users.get(id))
            .map(|record| record.display_name.clone())
            .collect()
    }

    /// Get the number of connected users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if no users are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_on_connect_creates_roomless_record() {
        let mut presence = PresenceStore::new();
        let record = presence.on_connect("u1", "Alice", conn("c1"));

        assert_eq!(record.display_name, "Alice");
        assert!(record.current_room.is_none());
        assert!(record.is_owned_by(&conn("c1")));
        assert_eq!(presence.len(), 1);
    }

    #[test]
    fn test_on_connect_replaces_record() {
        let mut presence = PresenceStore::new();
        presence.on_connect("u1", "Alice", conn("c1"));
        presence.set_current_room("u1", Some("room".into()));

        let record = presence.on_connect("u1", "Alice2", conn("c2"));
        assert!(record.current_room.is_none());
        assert!(record.is_owned_by(&conn("c2")));
        assert_eq!(presence.len(), 1);
    }

    #[test]
    fn test_set_display_name() {
        let mut presence = PresenceStore::new();
        presence.on_connect("u1", "Alice", conn("c1"));

        assert_eq!(presence.set_display_name("u1", "Al"), Some("Alice".into()));
        assert_eq!(presence.get("u1").unwrap().display_name, "Al");
        assert_eq!(presence.set_display_name("u2", "Bob"), None);
    }

    #[test]
    fn test_set_current_room() {
        let mut presence = PresenceStore::new();
        presence.on_connect("u1", "Alice", conn("c1"));

        assert!(presence.set_current_room("u1", Some("r1".into())));
        assert_eq!(presence.get("u1").unwrap().current_room.as_deref(), Some("r1"));
        assert!(presence.set_current_room("u1", None));
        assert!(presence.get("u1").unwrap().current_room.is_none());
        assert!(!presence.set_current_room("ghost", None));
    }

    #[test]
    fn test_remove() {
        let mut presence = PresenceStore::new();
        presence.on_connect("u1", "Alice", conn("c1"));

        assert!(presence.remove("u1").is_some());
        assert!(presence.remove("u1").is_none());
        assert!(presence.is_empty());
    }

    #[test]
    fn test_resolve_names_skips_missing() {
        let mut presence = PresenceStore::new();
        presence.on_connect("u1", "Alice", conn("c1"));
        presence.on_connect("u3", "Carol", conn("c3"));

        let ids: Vec<UserId> = vec!["u1".into(), "u2".into(), "u3".into()];
        assert_eq!(presence.resolve_names(&ids), vec!["Alice", "Carol"]);
    }
}
