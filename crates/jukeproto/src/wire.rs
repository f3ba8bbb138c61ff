//! JSON message shapes for the room (device) socket and the observer socket.
//!
//! Field names are camelCase on the wire; clients are browsers and small
//! embedded players. The device socket is bidirectional; the observer
//! socket is server-to-client only.

use crate::domain::{Device, DeviceId, DeviceRole, PlaybackState, RoomId, Song, SongId};
use serde::{Deserialize, Serialize};

/// A playback command carried by `command` frames and fanned out in
/// `execute` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandAction {
    Play,
    Pause,
    Toggle,
    Skip,
    Seek,
    SetVolume,
    ToggleMute,
    Rate,
    SelectSong,
    SyncAll,
    ResetToDefault,
}

impl CommandAction {
    /// Commands that may carry a `targetDeviceId` and move the target into
    /// individual mode.
    pub fn is_targetable(&self) -> bool {
        matches!(
            self,
            CommandAction::Play
                | CommandAction::Pause
                | CommandAction::Toggle
                | CommandAction::SetVolume
                | CommandAction::ToggleMute
        )
    }
}

/// Client → server frames on the room socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: RoomId,
        device_id: DeviceId,
        name: String,
        role: DeviceRole,
    },
    #[serde(rename_all = "camelCase")]
    Command {
        action: CommandAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_device_id: Option<DeviceId>,
    },
    #[serde(rename_all = "camelCase")]
    Sync {
        current_song_id: Option<SongId>,
        is_playing: bool,
        current_time: f64,
        duration: f64,
    },
    SongEnded,
    #[serde(rename_all = "camelCase")]
    Ping { client_time: f64 },
}

/// Scope marker on `execute` frames: whether the command was room-wide or
/// aimed at this device alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecuteScope {
    Room,
    Device,
}

/// Server → client frames on the room socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    State {
        playback: PlaybackState,
        current_song: Option<Song>,
        devices: Vec<Device>,
    },
    Queue { songs: Vec<Song> },
    #[serde(rename_all = "camelCase")]
    Execute {
        action: CommandAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        scope: ExecuteScope,
    },
    #[serde(rename_all = "camelCase")]
    NextSong {
        song_id: SongId,
        audio_url: String,
        /// Server-clock unix millis ~500ms out; clients schedule the local
        /// load for that instant.
        #[serde(skip_serializing_if = "Option::is_none")]
        start_at: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Preload { song_id: SongId, audio_url: String },
    #[serde(rename_all = "camelCase")]
    Pong { client_time: f64, server_time: f64 },
}

/// Envelope broadcast to passive browser observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverEnvelope {
    pub routing_key: String,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_join_frame_shape() {
        let text = r#"{"type":"join","roomId":"room-1","deviceId":"dev-a","name":"Kitchen","role":"player"}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        match msg {
            ClientMessage::Join { room_id, role, .. } => {
                assert_eq!(room_id.as_str(), "room-1");
                assert_eq!(role, DeviceRole::Player);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_command_frame_with_target() {
        let text = r#"{"type":"command","action":"setVolume","payload":{"volume":0.3},"targetDeviceId":"dev-a"}"#;
        let msg: ClientMessage = serde_json::from_str(text).unwrap();
        match msg {
            ClientMessage::Command {
                action,
                payload,
                target_device_id,
            } => {
                assert_eq!(action, CommandAction::SetVolume);
                assert_eq!(payload.unwrap()["volume"], 0.3);
                assert_eq!(target_device_id.unwrap().as_str(), "dev-a");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_song_ended_is_bare() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"songEnded"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SongEnded));
    }

    #[test]
    fn test_execute_frame_scope() {
        let frame = ServerMessage::Execute {
            action: CommandAction::Pause,
            payload: None,
            scope: ExecuteScope::Device,
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "execute");
        assert_eq!(json["action"], "pause");
        assert_eq!(json["scope"], "device");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_pong_echoes_client_time() {
        let frame = ServerMessage::Pong {
            client_time: 123.5,
            server_time: 999.0,
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["clientTime"], 123.5);
        assert_eq!(json["serverTime"], 999.0);
    }
}
