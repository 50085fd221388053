//! # parley-core
//!
//! Room, presence and delivery state for the Parley collaboration hub.
//!
//! This crate provides the building blocks:
//!
//! - **Registry** - Live connection handles keyed by user
//! - **Directory** - Rooms, their members and bounded message history
//! - **Presence** - Per-user display name and current room
//! - **Hub** - The state machine tying the three together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│     Hub     │────▶│  Directory  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │    │
//!        │                   ▼    └──────▶┌─────────────┐
//!        │            ┌─────────────┐     │  Presence   │
//!        └────────────│  Registry   │     └─────────────┘
//!                     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use parley_core::CollaborationHub;
//! use parley_protocol::ClientEvent;
//!
//! let hub = CollaborationHub::new();
//! let (mut session, mut outbound) = hub.open_session();
//!
//! hub.handle_event(&mut session, ClientEvent::user_connect("u1", "alice")).unwrap();
//!
//! let frame = outbound.try_recv().unwrap();
//! assert!(frame.contains("rooms_list"));
//! ```

pub mod directory;
pub mod hub;
pub mod message;
pub mod presence;
pub mod registry;

/// Client-supplied user identifier.
pub type UserId = String;

/// Server-assigned room identifier.
pub type RoomId = String;

pub use directory::{DirectoryConfig, DirectoryError, Room, RoomDirectory};
pub use hub::{CollaborationHub, HubConfig, HubError, HubStats, Session, SessionState};
pub use message::ChatMessage;
pub use presence::{PresenceStore, UserRecord};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Frame};
