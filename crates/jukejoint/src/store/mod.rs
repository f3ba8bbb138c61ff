//! Persistent store interface.
//!
//! The core treats the relational store as a collaborator: these are the
//! operations it calls, nothing more. All operations are idempotent on
//! retry except `create_pending_song`, which the pipeline guards with its
//! in-flight set.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use jukeproto::{Playlist, PlaylistId, Song, SongId, SongStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition for song {song}: {from} -> {to}")]
    InvalidTransition {
        song: SongId,
        from: SongStatus,
        to: SongStatus,
    },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Aggregate view of a playlist's generation queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkQueueInfo {
    /// Highest `order_index` of any song in the playlist; 0.0 when empty.
    pub max_order_index: f64,
}

/// Options for `create_pending_song`.
#[derive(Debug, Clone, Default)]
pub struct NewSongOptions {
    pub prompt_epoch: i64,
    pub is_interrupt: bool,
    pub interrupt_prompt: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_playlist_by_id(&self, id: &PlaylistId) -> StoreResult<Option<Playlist>>;
    async fn get_playlist_by_key(&self, key: &str) -> StoreResult<Option<Playlist>>;
    async fn list_playlists_by_owner(&self, owner_user_id: &str) -> StoreResult<Vec<Playlist>>;

    async fn get_song(&self, id: &SongId) -> StoreResult<Option<Song>>;
    async fn list_songs_by_playlist(&self, playlist_id: &PlaylistId) -> StoreResult<Vec<Song>>;
    async fn get_work_queue(&self, playlist_id: &PlaylistId) -> StoreResult<WorkQueueInfo>;

    async fn create_pending_song(
        &self,
        playlist_id: &PlaylistId,
        order_index: f64,
        options: NewSongOptions,
    ) -> StoreResult<Song>;

    /// Forward status transition; illegal transitions are refused with
    /// `StoreError::InvalidTransition`.
    async fn update_song_status(&self, id: &SongId, status: SongStatus) -> StoreResult<()>;

    async fn update_song_metadata(
        &self,
        id: &SongId,
        title: &str,
        style: &str,
    ) -> StoreResult<()>;
    async fn update_song_ace_task(&self, id: &SongId, task_id: &str) -> StoreResult<()>;
    async fn update_song_cover(&self, id: &SongId, cover_url: &str) -> StoreResult<()>;

    async fn mark_song_ready(
        &self,
        id: &SongId,
        audio_url: &str,
        audio_duration: Option<f64>,
    ) -> StoreResult<()>;
    async fn mark_song_error(
        &self,
        id: &SongId,
        message: &str,
        errored_at_status: SongStatus,
    ) -> StoreResult<()>;
    async fn mark_song_cancelled(
        &self,
        id: &SongId,
        cancelled_at_status: SongStatus,
    ) -> StoreResult<()>;
    async fn mark_song_played(&self, id: &SongId) -> StoreResult<()>;

    async fn update_playlist_position(
        &self,
        id: &PlaylistId,
        order_index: f64,
    ) -> StoreResult<()>;
    /// Keep a temporary playlist alive. Idempotent.
    async fn heartbeat_playlist(&self, id: &PlaylistId) -> StoreResult<()>;
    /// Delete temporary playlists whose heartbeat went stale; returns the
    /// ids removed so callers can emit `playlist.deleted`.
    async fn delete_expired_temporary_playlists(
        &self,
        ttl: std::time::Duration,
    ) -> StoreResult<Vec<PlaylistId>>;
}

/// Whether a song may move `from` -> `to`.
///
/// The happy path walks the pipeline in order; `error`/`cancelled` are
/// reachable from any non-terminal status, and resume re-enters at
/// `pending` or `metadata_ready`.
pub fn transition_allowed(from: SongStatus, to: SongStatus) -> bool {
    use SongStatus::*;
    match (from, to) {
        (Pending, GeneratingMetadata) => true,
        (GeneratingMetadata, MetadataReady) => true,
        (MetadataReady, SubmittingToAce) => true,
        (SubmittingToAce, GeneratingAudio) => true,
        (GeneratingAudio, Saving) => true,
        (Saving, Ready) => true,
        // Save failures are isolated: the song can go ready straight from
        // the audio branch with the endpoint URL.
        (GeneratingAudio, Ready) => true,
        (Ready, Played) => true,
        (from, Error) | (from, Cancelled) => !from.is_terminal(),
        // Resume / restart paths: errored, cancelled, or stale in-flight
        // songs re-enter at pending or metadata_ready.
        (Error, Pending) | (Error, MetadataReady) => true,
        (Cancelled, Pending) | (Cancelled, MetadataReady) => true,
        (from, Pending) | (from, MetadataReady) if from.is_generating() => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions_allowed() {
        use SongStatus::*;
        let path = [
            Pending,
            GeneratingMetadata,
            MetadataReady,
            SubmittingToAce,
            GeneratingAudio,
            Saving,
            Ready,
            Played,
        ];
        for pair in path.windows(2) {
            assert!(transition_allowed(pair[0], pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_terminal_statuses_cannot_error() {
        use SongStatus::*;
        assert!(!transition_allowed(Ready, Error));
        assert!(!transition_allowed(Played, Cancelled));
        assert!(!transition_allowed(Cancelled, Error));
    }

    #[test]
    fn test_backwards_jumps_refused() {
        use SongStatus::*;
        assert!(!transition_allowed(Ready, GeneratingMetadata));
        assert!(!transition_allowed(Ready, Pending));
        assert!(!transition_allowed(Pending, Ready));
        assert!(!transition_allowed(Pending, Saving));
    }

    #[test]
    fn test_stale_in_flight_statuses_can_reenter() {
        use SongStatus::*;
        assert!(transition_allowed(GeneratingAudio, MetadataReady));
        assert!(transition_allowed(GeneratingMetadata, Pending));
        assert!(transition_allowed(Cancelled, Pending));
    }
}
