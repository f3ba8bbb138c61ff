//! jukeproto - Domain and wire types for the Jukejoint server
//!
//! This crate defines the records the server core passes around (songs,
//! playlists, playback state, devices), the closed set of bus events, and
//! the JSON message shapes spoken on the room and observer WebSockets.
//! It does no I/O of its own.

pub mod domain;
pub mod events;
pub mod wire;

pub use domain::{
    Device, DeviceId, DeviceMode, DeviceRole, PlaybackState, Playlist, PlaylistId, PlaylistStatus,
    RoomId, Song, SongId, SongStatus,
};
pub use events::{Event, EventKind};
pub use wire::{ClientMessage, CommandAction, ExecuteScope, ObserverEnvelope, ServerMessage};

use thiserror::Error;

/// Errors produced while decoding messages off a socket.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported message kind: {0}")]
    UnsupportedKind(String),
}

/// Decode one client frame from room-socket text.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtoError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode one server frame to room-socket text.
///
/// Serialization of these shapes cannot fail; a failure here would mean a
/// non-string key snuck into a payload map, which is logged and dropped by
/// the caller.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(msg)?)
}
