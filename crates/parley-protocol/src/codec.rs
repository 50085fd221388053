//! Codec for encoding and decoding Parley frames.
//!
//! Frames are self-delimiting: one JSON object per WebSocket message, with no
//! length prefix and no trailing newline.

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Default maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Not valid JSON, unknown `type`, or a required field is missing.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field is present but empty.
    #[error("Field `{0}` must not be empty")]
    EmptyField(&'static str),
}

/// Encode a server event to a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a client event from a text frame using the default size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, or fails validation.
pub fn decode(text: &str) -> Result<ClientEvent, ProtocolError> {
    FrameCodec::new().decode(text.as_bytes())
}

/// Decode a server event, as a client would.
///
/// # Errors
///
/// Returns an error if the frame is malformed.
pub fn decode_server(text: &str) -> Result<ServerEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Reject identifiers that are present but blank.
fn validate(event: &ClientEvent) -> Result<(), ProtocolError> {
    match event {
        ClientEvent::UserConnect { user_id, .. } if user_id.trim().is_empty() => {
            Err(ProtocolError::EmptyField("userId"))
        }
        ClientEvent::JoinRoom { room_id } if room_id.is_empty() => {
            Err(ProtocolError::EmptyField("roomId"))
        }
        _ => Ok(()),
    }
}

/// Frame codec with a configurable inbound size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a new codec instance with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that rejects inbound frames larger than `max_frame_size`.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Get the inbound size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a server event to a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, event: &ServerEvent) -> Result<String, ProtocolError> {
        encode(event)
    }

    /// Decode and validate a client event from raw frame bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large, malformed, or fails validation.
    pub fn decode(&self, data: &[u8]) -> Result<ClientEvent, ProtocolError> {
        let event: ClientEvent = self.decode_any(data)?;
        validate(&event)?;
        Ok(event)
    }

    fn decode_any<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }
        Ok(serde_json::from_slice(data)?)
    }
}
