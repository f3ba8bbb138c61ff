//! Domain records shared between the store, the pipeline, and the rooms.

use serde::{Deserialize, Serialize};

/// Unique identifier for a song row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SongId(pub String);

impl SongId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a fresh song id.
    pub fn generate() -> Self {
        Self(format!("song-{}", uuid::Uuid::new_v4().as_simple()))
    }
}

impl std::fmt::Display for SongId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a playlist row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaylistId(pub String);

impl PlaylistId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn generate() -> Self {
        Self(format!("pl-{}", uuid::Uuid::new_v4().as_simple()))
    }
}

impl std::fmt::Display for PlaylistId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-local identifier for a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn generate() -> Self {
        Self(format!("room-{}", uuid::Uuid::new_v4().as_simple()))
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-assigned identifier for a device socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one song through the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SongStatus {
    Pending,
    GeneratingMetadata,
    MetadataReady,
    SubmittingToAce,
    GeneratingAudio,
    Saving,
    Ready,
    Played,
    Error,
    Cancelled,
}

impl SongStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SongStatus::Pending => "pending",
            SongStatus::GeneratingMetadata => "generating_metadata",
            SongStatus::MetadataReady => "metadata_ready",
            SongStatus::SubmittingToAce => "submitting_to_ace",
            SongStatus::GeneratingAudio => "generating_audio",
            SongStatus::Saving => "saving",
            SongStatus::Ready => "ready",
            SongStatus::Played => "played",
            SongStatus::Error => "error",
            SongStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => SongStatus::Pending,
            "generating_metadata" => SongStatus::GeneratingMetadata,
            "metadata_ready" => SongStatus::MetadataReady,
            "submitting_to_ace" => SongStatus::SubmittingToAce,
            "generating_audio" => SongStatus::GeneratingAudio,
            "saving" => SongStatus::Saving,
            "ready" => SongStatus::Ready,
            "played" => SongStatus::Played,
            "error" => SongStatus::Error,
            "cancelled" => SongStatus::Cancelled,
            _ => return None,
        })
    }

    /// True while the song is somewhere between submit and finished audio.
    pub fn is_generating(&self) -> bool {
        matches!(
            self,
            SongStatus::GeneratingMetadata
                | SongStatus::MetadataReady
                | SongStatus::SubmittingToAce
                | SongStatus::GeneratingAudio
                | SongStatus::Saving
        )
    }

    /// No further pipeline work will happen in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SongStatus::Ready | SongStatus::Played | SongStatus::Error | SongStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SongStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One song as the core sees it.
///
/// `order_index` is real-valued: interrupts are inserted at fractional
/// positions (typically `current + 0.5`) so they sort right after the song
/// playing when they were requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub id: SongId,
    pub playlist_id: PlaylistId,
    pub order_index: f64,
    pub status: SongStatus,
    pub title: Option<String>,
    pub style: Option<String>,
    pub audio_url: Option<String>,
    pub audio_duration: Option<f64>,
    pub cover_url: Option<String>,
    pub is_interrupt: bool,
    pub interrupt_prompt: Option<String>,
    pub prompt_epoch: i64,
    pub ace_task_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Song {
    /// A song can be picked for playback only once its audio exists.
    pub fn is_playable(&self) -> bool {
        self.audio_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Playlist lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistStatus {
    Active,
    Closing,
    Closed,
}

impl PlaylistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistStatus::Active => "active",
            PlaylistStatus::Closing => "closing",
            PlaylistStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => PlaylistStatus::Active,
            "closing" => PlaylistStatus::Closing,
            "closed" => PlaylistStatus::Closed,
            _ => return None,
        })
    }
}

/// One playlist as the core sees it.
///
/// `prompt_epoch` is bumped every time the playlist is steered; songs carry
/// the epoch they were generated at and stale-epoch songs act only as
/// filler during selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: PlaylistId,
    pub playlist_key: String,
    pub name: String,
    pub prompt: String,
    pub prompt_epoch: i64,
    pub current_order_index: f64,
    pub status: PlaylistStatus,
    pub owner_user_id: String,
    pub is_temporary: bool,
}

/// What a device does in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Observes state and issues commands; no audio output.
    Controller,
    /// Audio output; follows execute broadcasts.
    Player,
}

/// Whether a device follows room-wide commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// Receives room-wide execute broadcasts.
    Default,
    /// Opted out until reset_to_default or sync_all.
    Individual,
}

/// One connected device as reported in state broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub role: DeviceRole,
    pub mode: DeviceMode,
}

/// The room's authoritative playback view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub current_song_id: Option<SongId>,
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub volume: f64,
    pub is_muted: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_song_id: None,
            is_playing: false,
            current_time: 0.0,
            duration: 0.0,
            volume: 1.0,
            is_muted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_song_status_round_trip() {
        for status in [
            SongStatus::Pending,
            SongStatus::GeneratingMetadata,
            SongStatus::MetadataReady,
            SongStatus::SubmittingToAce,
            SongStatus::GeneratingAudio,
            SongStatus::Saving,
            SongStatus::Ready,
            SongStatus::Played,
            SongStatus::Error,
            SongStatus::Cancelled,
        ] {
            assert_eq!(SongStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SongStatus::parse("resting"), None);
    }

    #[test]
    fn test_song_status_serde_matches_as_str() {
        let json = serde_json::to_string(&SongStatus::SubmittingToAce).unwrap();
        assert_eq!(json, "\"submitting_to_ace\"");
    }

    #[test]
    fn test_playable_requires_nonempty_audio_url() {
        let mut song = Song {
            id: SongId::new("s1"),
            playlist_id: PlaylistId::new("pl1"),
            order_index: 1.0,
            status: SongStatus::Ready,
            title: None,
            style: None,
            audio_url: None,
            audio_duration: None,
            cover_url: None,
            is_interrupt: false,
            interrupt_prompt: None,
            prompt_epoch: 0,
            ace_task_id: None,
            error_message: None,
            created_at: chrono::Utc::now(),
        };
        assert!(!song.is_playable());
        song.audio_url = Some(String::new());
        assert!(!song.is_playable());
        song.audio_url = Some("/media/s1.mp3".to_string());
        assert!(song.is_playable());
    }
}
