//! The collaboration hub.
//!
//! The hub applies client events to the shared room and presence state and
//! fans the resulting notifications out through the connection registry.
//!
//! ## Locking
//!
//! Presence and directory state live behind a single mutex. Every transition,
//! including the deliveries it causes, runs inside one critical section, so a
//! room's members observe messages in the order they were appended and never
//! see a half-applied join or leave. Deliveries only try to enqueue onto bounded
//! per-connection queues and never wait on a peer; a peer whose queue is full
//! is torn down like a closed socket.

use parley_protocol::{codec, ClientEvent, RoomSummary, ServerEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directory::{
    DirectoryConfig, DirectoryError, RoomDirectory, DEFAULT_HISTORY_CAPACITY, DEFAULT_RECENT_LIMIT,
};
use crate::message::ChatMessage;
use crate::presence::PresenceStore;
use crate::registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, Frame, DEFAULT_OUTBOUND_QUEUE,
};
use crate::{RoomId, UserId};

/// Hub errors.
///
/// These describe events the hub refused to apply. None of them is sent to
/// the client; callers log them and keep the connection open.
#[derive(Debug, Error)]
pub enum HubError {
    /// The connection has not sent `user_connect` yet.
    #[error("Connection is not identified")]
    NotIdentified,

    /// The connection already sent `user_connect`.
    #[error("Connection is already bound to user {0}")]
    AlreadyIdentified(UserId),

    /// The user was taken over by a newer connection, or torn down.
    #[error("Connection no longer owns user {0}")]
    Superseded(UserId),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// The user is not in a room.
    #[error("User {0} is not in a room")]
    NotInRoom(UserId),

    /// Room directory rejected the operation.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages included in a `room_joined` snapshot.
    pub recent_message_limit: usize,
    /// Messages retained per room. Raised to `recent_message_limit` if lower.
    pub history_capacity: usize,
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Tell room members when someone changes display name.
    pub broadcast_renames: bool,
    /// Frames queued per connection before it counts as stalled.
    pub outbound_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            recent_message_limit: DEFAULT_RECENT_LIMIT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_rooms: 10_000,
            broadcast_renames: true,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

/// Observable state of a connection.
///
/// A connection reaches its terminal state when [`CollaborationHub::disconnect`]
/// consumes its [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, no `user_connect` yet.
    Unidentified,
    /// Identified, not in a room.
    Idle,
    /// Identified and in a room.
    InRoom(RoomId),
    /// The user ID was re-bound by a newer connection.
    Superseded,
}

#[derive(Debug)]
enum Binding {
    /// Waiting for `user_connect`; holds the handle to register.
    Pending(ConnectionHandle),
    /// Bound to a user; the registry holds the handle.
    Bound(UserId),
}

/// Per-connection state, owned by the connection's task.
#[derive(Debug)]
pub struct Session {
    connection_id: ConnectionId,
    binding: Binding,
}

impl Session {
    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Get the bound user ID, if identified.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match &self.binding {
            Binding::Bound(user_id) => Some(user_id),
            Binding::Pending(_) => None,
        }
    }
}

struct HubState {
    presence: PresenceStore,
    directory: RoomDirectory,
}

impl HubState {
    /// Display names of a room's members, in join order.
    fn member_names(&self, room_id: &str) -> Vec<String> {
        self.presence
            .resolve_names(self.directory.members(room_id))
    }

    fn rooms_list(&self) -> Vec<RoomSummary> {
        self.directory
            .list_rooms()
            .into_iter()
            .map(|(room, count)| room.summary(count))
            .collect()
    }
}

/// The collaboration hub.
pub struct CollaborationHub {
    state: Mutex<HubState>,
    registry: ConnectionRegistry,
    config: HubConfig,
}

impl CollaborationHub {
    /// Create a new hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a new hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        let directory = RoomDirectory::with_config(DirectoryConfig {
            max_rooms: config.max_rooms,
            history_capacity: config.history_capacity.max(config.recent_message_limit),
        });
        Self {
            state: Mutex::new(HubState {
                presence: PresenceStore::new(),
                directory,
            }),
            registry: ConnectionRegistry::new(),
            config,
        }
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session for a new connection.
    ///
    /// Returns the session and the receiver of frames addressed to it. The
    /// receiver yields `None` once the hub drops the connection's handle,
    /// e.g. after a newer connection took over the same user ID.
    #[must_use]
    pub fn open_session(&self) -> (Session, mpsc::Receiver<Frame>) {
        let (handle, rx) = ConnectionHandle::with_capacity(self.config.outbound_queue);
        debug!(connection = %handle.id(), "Session opened");
        let session = Session {
            connection_id: handle.id().clone(),
            binding: Binding::Pending(handle),
        };
        (session, rx)
    }

    /// Apply one client event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event's precondition does not hold. Nothing is
    /// changed or sent in that case.
    pub fn handle_event(&self, session: &mut Session, event: ClientEvent) -> Result<(), HubError> {
        let mut state = self.lock();
        let result = match event {
            ClientEvent::UserConnect { user_id, username } => {
                self.user_connect(&mut state, session, user_id, username)
            }
            ClientEvent::GetRooms => self.get_rooms(&state, session),
            ClientEvent::CreateRoom {
                name,
                description,
                is_private,
            } => self.create_room(
                &mut state,
                session,
                name,
                description.unwrap_or_default(),
                is_private.unwrap_or(false),
            ),
            ClientEvent::JoinRoom { room_id } => self.join_room(&mut state, session, room_id),
            ClientEvent::LeaveRoom => self.leave_room(&mut state, session),
            ClientEvent::SendMessage { content } => self.send_message(&mut state, session, content),
            ClientEvent::UpdateUsername { username } => {
                self.update_username(&mut state, session, username)
            }
        };
        self.reap(&mut state);
        result
    }

    /// Tear down a closed connection.
    ///
    /// If the connection still owns its user, the user leaves its room (the
    /// remaining members get `user_left`), its presence record is removed and
    /// its handle unregistered. A superseded connection changes nothing.
    pub fn disconnect(&self, session: Session) {
        let Binding::Bound(user_id) = session.binding else {
            debug!(connection = %session.connection_id, "Unidentified connection closed");
            return;
        };

        let mut state = self.lock();
        let owned = state
            .presence
            .get(&user_id)
            .is_some_and(|record| record.is_owned_by(&session.connection_id));

        if owned {
            self.teardown(&mut state, &user_id);
        } else {
            debug!(user = %user_id, connection = %session.connection_id, "Superseded connection closed");
        }
        self.reap(&mut state);
    }

    /// Get the observable state of a session.
    #[must_use]
    pub fn session_state(&self, session: &Session) -> SessionState {
        let Binding::Bound(user_id) = &session.binding else {
            return SessionState::Unidentified;
        };
        let state = self.lock();
        match state.presence.get(user_id) {
            Some(record) if record.is_owned_by(&session.connection_id) => {
                match &record.current_room {
                    Some(room_id) => SessionState::InRoom(room_id.clone()),
                    None => SessionState::Idle,
                }
            }
            _ => SessionState::Superseded,
        }
    }

    /// Get a snapshot of all rooms with member counts, in creation order.
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.lock().rooms_list()
    }

    /// Get the room a user is in.
    #[must_use]
    pub fn current_room(&self, user_id: &str) -> Option<RoomId> {
        self.lock()
            .presence
            .get(user_id)
            .and_then(|record| record.current_room.clone())
    }

    /// Get the display names of a room's members, in join order.
    #[must_use]
    pub fn member_names(&self, room_id: &str) -> Vec<String> {
        self.lock().member_names(room_id)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let state = self.lock();
        HubStats {
            room_count: state.directory.len(),
            online_users: state.presence.len(),
            connections: self.registry.len(),
        }
    }

    fn user_connect(
        &self,
        state: &mut HubState,
        session: &mut Session,
        user_id: UserId,
        username: String,
    ) -> Result<(), HubError> {
        let handle = match &session.binding {
            Binding::Pending(handle) => handle.clone(),
            Binding::Bound(bound) => return Err(HubError::AlreadyIdentified(bound.clone())),
        };

        if state.presence.get(&user_id).is_some() {
            info!(user = %user_id, connection = %session.connection_id, "User reconnected, superseding old connection");
            self.teardown(state, &user_id);
        }

        state
            .presence
            .on_connect(&user_id, username, session.connection_id.clone());
        self.registry.register(&user_id, handle);
        // Drop the session's copy so the registry holds the only sender.
        session.binding = Binding::Bound(user_id.clone());

        debug!(user = %user_id, connection = %session.connection_id, "User connected");

        self.unicast(
            &user_id,
            &ServerEvent::RoomsList {
                rooms: state.rooms_list(),
            },
        );
        Ok(())
    }

    fn get_rooms(&self, state: &HubState, session: &Session) -> Result<(), HubError> {
        let user_id = Self::identify(state, session)?;
        self.unicast(
            &user_id,
            &ServerEvent::RoomsList {
                rooms: state.rooms_list(),
            },
        );
        Ok(())
    }

    fn create_room(
        &self,
        state: &mut HubState,
        session: &Session,
        name: String,
        description: String,
        is_private: bool,
    ) -> Result<(), HubError> {
        let user_id = Self::identify(state, session)?;
        let room = state
            .directory
            .create_room(name, description, is_private, &user_id)?;

        self.unicast(&user_id, &ServerEvent::RoomCreated { room: room.info() });
        Ok(())
    }

    fn join_room(
        &self,
        state: &mut HubState,
        session: &Session,
        room_id: RoomId,
    ) -> Result<(), HubError> {
        let user_id = Self::identify(state, session)?;
        let details = state
            .directory
            .get_room(&room_id)
            .map(|room| room.details())
            .ok_or_else(|| HubError::RoomNotFound(room_id.clone()))?;

        let (previous, username) = match state.presence.get(&user_id) {
            Some(record) => (record.current_room.clone(), record.display_name.clone()),
            None => return Err(HubError::Superseded(user_id)),
        };

        // Rejoining the current room runs the same leave-then-join sequence.
        if let Some(previous) = previous {
            state.directory.remove_member(&previous, &user_id);
            let users = state.member_names(&previous);
            self.broadcast(
                state,
                &previous,
                &ServerEvent::UserLeft {
                    username: username.clone(),
                    users,
                },
                Some(&user_id),
            );
        }

        state.directory.add_member(&room_id, &user_id);
        state
            .presence
            .set_current_room(&user_id, Some(room_id.clone()));

        let users = state.member_names(&room_id);
        let messages = state
            .directory
            .recent_messages(&room_id, self.config.recent_message_limit)
            .into_iter()
            .map(ChatMessage::to_view)
            .collect();

        debug!(user = %user_id, room = %room_id, "Joined room");

        self.unicast(
            &user_id,
            &ServerEvent::RoomJoined {
                room: details,
                messages,
                users: users.clone(),
            },
        );
        self.broadcast(
            state,
            &room_id,
            &ServerEvent::UserJoined { username, users },
            Some(&user_id),
        );
        Ok(())
    }

    fn leave_room(&self, state: &mut HubState, session: &Session) -> Result<(), HubError> {
        let user_id = Self::identify(state, session)?;
        let (room_id, username) = match state.presence.get(&user_id) {
            Some(record) => match &record.current_room {
                Some(room_id) => (room_id.clone(), record.display_name.clone()),
                None => return Err(HubError::NotInRoom(user_id)),
            },
            None => return Err(HubError::Superseded(user_id)),
        };

        state.directory.remove_member(&room_id, &user_id);
        state.presence.set_current_room(&user_id, None);

        debug!(user = %user_id, room = %room_id, "Left room");

        self.unicast(&user_id, &ServerEvent::RoomLeft);
        let users = state.member_names(&room_id);
        self.broadcast(
            state,
            &room_id,
            &ServerEvent::UserLeft { username, users },
            Some(&user_id),
        );
        Ok(())
    }

    fn send_message(
        &self,
        state: &mut HubState,
        session: &Session,
        content: String,
    ) -> Result<(), HubError> {
        let user_id = Self::identify(state, session)?;
        let message = match state.presence.get(&user_id) {
            Some(record) => match &record.current_room {
                Some(room_id) => ChatMessage::new(
                    room_id.clone(),
                    user_id.clone(),
                    record.display_name.clone(),
                    content,
                ),
                None => return Err(HubError::NotInRoom(user_id)),
            },
            None => return Err(HubError::Superseded(user_id)),
        };

        let room_id = message.room_id.clone();
        let event = ServerEvent::NewMessage {
            message: message.to_view(),
        };
        state.directory.append_message(message)?;

        // The sender is included: clients render their own messages from the echo.
        self.broadcast(state, &room_id, &event, None);
        Ok(())
    }

    fn update_username(
        &self,
        state: &mut HubState,
        session: &Session,
        username: String,
    ) -> Result<(), HubError> {
        let user_id = Self::identify(state, session)?;
        let old_username = state
            .presence
            .set_display_name(&user_id, username.clone())
            .ok_or_else(|| HubError::Superseded(user_id.clone()))?;

        debug!(user = %user_id, from = %old_username, to = %username, "Renamed");

        if !self.config.broadcast_renames || old_username == username {
            return Ok(());
        }
        let Some(room_id) = state
            .presence
            .get(&user_id)
            .and_then(|record| record.current_room.clone())
        else {
            return Ok(());
        };

        let users = state.member_names(&room_id);
        self.broadcast(
            state,
            &room_id,
            &ServerEvent::UserRenamed {
                old_username,
                username,
                users,
            },
            Some(&user_id),
        );
        Ok(())
    }

    /// Resolve the user a session speaks for.
    fn identify(state: &HubState, session: &Session) -> Result<UserId, HubError> {
        match &session.binding {
            Binding::Pending(_) => Err(HubError::NotIdentified),
            Binding::Bound(user_id) => match state.presence.get(user_id) {
                Some(record) if record.is_owned_by(&session.connection_id) => Ok(user_id.clone()),
                _ => Err(HubError::Superseded(user_id.clone())),
            },
        }
    }

    /// Remove every trace of a user: membership, presence and handle.
    fn teardown(&self, state: &mut HubState, user_id: &str) {
        let Some(record) = state.presence.remove(user_id) else {
            return;
        };

        if let Some(room_id) = &record.current_room {
            state.directory.remove_member(room_id, user_id);
            let users = state.member_names(room_id);
            self.broadcast(
                state,
                room_id,
                &ServerEvent::UserLeft {
                    username: record.display_name.clone(),
                    users,
                },
                Some(user_id),
            );
        }

        self.registry
            .unregister_connection(user_id, &record.connection_id);
        debug!(user = %user_id, connection = %record.connection_id, "User torn down");
    }

    /// Tear down users whose handles failed during delivery.
    ///
    /// Teardown broadcasts can produce further casualties, so this loops
    /// until none are left. Each pass removes at least one presence record.
    fn reap(&self, state: &mut HubState) {
        loop {
            let casualties = self.registry.take_casualties();
            if casualties.is_empty() {
                return;
            }
            for (user_id, connection_id) in casualties {
                let owned = state
                    .presence
                    .get(&user_id)
                    .is_some_and(|record| record.is_owned_by(&connection_id));
                if owned {
                    debug!(user = %user_id, connection = %connection_id, "Reaping failed connection");
                    self.teardown(state, &user_id);
                }
            }
        }
    }

    fn unicast(&self, user_id: &str, event: &ServerEvent) {
        if let Some(frame) = encode(event) {
            self.registry.send_to(user_id, &frame);
        }
    }

    /// Deliver an event to every member of a room except `exclude`.
    fn broadcast(&self, state: &HubState, room_id: &str, event: &ServerEvent, exclude: Option<&str>) {
        let Some(frame) = encode(event) else {
            return;
        };
        let mut recipients = 0;
        for member in state.directory.members(room_id) {
            if Some(member.as_str()) == exclude {
                continue;
            }
            self.registry.send_to(member, &frame);
            recipients += 1;
        }
        debug!(room = %room_id, event = event.kind(), recipients, "Broadcast");
    }
}

impl Default for CollaborationHub {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(event: &ServerEvent) -> Option<Frame> {
    match codec::encode(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            warn!(event = event.kind(), error = %e, "Failed to encode event");
            None
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Number of rooms.
    pub room_count: usize,
    /// Number of identified users.
    pub online_users: usize,
    /// Number of registered handles.
    pub connections: usize,
}
