//! # parley-protocol
//!
//! Wire protocol definitions for the Parley room hub.
//!
//! Every frame is a single JSON object carried in a WebSocket text message.
//! The object's `type` field selects the event kind; unknown fields are ignored.
//!
//! ## Event Kinds
//!
//! - [`ClientEvent`] - what a client may send (`user_connect`, `join_room`, ...)
//! - [`ServerEvent`] - what the hub sends back (`rooms_list`, `new_message`, ...)
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = codec::decode(r#"{"type":"join_room","roomId":"r-1"}"#).unwrap();
//! assert_eq!(event, ClientEvent::JoinRoom { room_id: "r-1".into() });
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use events::{ClientEvent, MessageView, RoomDetails, RoomInfo, RoomSummary, ServerEvent};
