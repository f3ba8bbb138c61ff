//! SQLite-backed store.
//!
//! Single connection behind a mutex; every operation is a short
//! transaction. WAL mode keeps readers (status endpoints) off the writers'
//! backs.

use super::{NewSongOptions, Store, StoreError, StoreResult, WorkQueueInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jukeproto::{Playlist, PlaylistId, PlaylistStatus, Song, SongId, SongStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS playlists (
    id                  TEXT PRIMARY KEY,
    playlist_key        TEXT NOT NULL UNIQUE,
    name                TEXT NOT NULL,
    prompt              TEXT NOT NULL DEFAULT '',
    prompt_epoch        INTEGER NOT NULL DEFAULT 0,
    current_order_index REAL NOT NULL DEFAULT 0,
    status              TEXT NOT NULL DEFAULT 'active',
    owner_user_id       TEXT NOT NULL,
    is_temporary        INTEGER NOT NULL DEFAULT 0,
    last_heartbeat_at   TEXT NOT NULL,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS songs (
    id                  TEXT PRIMARY KEY,
    playlist_id         TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
    order_index         REAL NOT NULL,
    status              TEXT NOT NULL DEFAULT 'pending',
    title               TEXT,
    style               TEXT,
    audio_url           TEXT,
    audio_duration      REAL,
    cover_url           TEXT,
    is_interrupt        INTEGER NOT NULL DEFAULT 0,
    interrupt_prompt    TEXT,
    prompt_epoch        INTEGER NOT NULL DEFAULT 0,
    ace_task_id         TEXT,
    error_message       TEXT,
    errored_at_status   TEXT,
    cancelled_at_status TEXT,
    created_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_songs_playlist_order
    ON songs (playlist_id, order_index);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the
    /// schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        info!("store ready at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a playlist row. Not part of the core `Store` contract (the
    /// REST layer owns playlist CRUD); used at seeding time and by tests.
    pub fn insert_playlist(&self, playlist: &Playlist) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO playlists
                 (id, playlist_key, name, prompt, prompt_epoch,
                  current_order_index, status, owner_user_id, is_temporary,
                  last_heartbeat_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                playlist.id.as_str(),
                playlist.playlist_key,
                playlist.name,
                playlist.prompt,
                playlist.prompt_epoch,
                playlist.current_order_index,
                playlist.status.as_str(),
                playlist.owner_user_id,
                playlist.is_temporary as i64,
                now,
            ],
        )?;
        Ok(())
    }

    /// Bump the prompt epoch (steering). Returns the new epoch.
    pub fn bump_prompt_epoch(&self, id: &PlaylistId) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE playlists SET prompt_epoch = prompt_epoch + 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("playlist {id}")));
        }
        let epoch = conn.query_row(
            "SELECT prompt_epoch FROM playlists WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(epoch)
    }

    fn song_from_row(row: &Row<'_>) -> rusqlite::Result<Song> {
        let status: String = row.get("status")?;
        let created_at: String = row.get("created_at")?;
        Ok(Song {
            id: SongId::new(row.get::<_, String>("id")?),
            playlist_id: PlaylistId::new(row.get::<_, String>("playlist_id")?),
            order_index: row.get("order_index")?,
            status: SongStatus::parse(&status).unwrap_or(SongStatus::Error),
            title: row.get("title")?,
            style: row.get("style")?,
            audio_url: row.get("audio_url")?,
            audio_duration: row.get("audio_duration")?,
            cover_url: row.get("cover_url")?,
            is_interrupt: row.get::<_, i64>("is_interrupt")? != 0,
            interrupt_prompt: row.get("interrupt_prompt")?,
            prompt_epoch: row.get("prompt_epoch")?,
            ace_task_id: row.get("ace_task_id")?,
            error_message: row.get("error_message")?,
            created_at: created_at
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    fn playlist_from_row(row: &Row<'_>) -> rusqlite::Result<Playlist> {
        let status: String = row.get("status")?;
        Ok(Playlist {
            id: PlaylistId::new(row.get::<_, String>("id")?),
            playlist_key: row.get("playlist_key")?,
            name: row.get("name")?,
            prompt: row.get("prompt")?,
            prompt_epoch: row.get("prompt_epoch")?,
            current_order_index: row.get("current_order_index")?,
            status: PlaylistStatus::parse(&status).unwrap_or(PlaylistStatus::Closed),
            owner_user_id: row.get("owner_user_id")?,
            is_temporary: row.get::<_, i64>("is_temporary")? != 0,
        })
    }

    fn current_status(conn: &Connection, id: &SongId) -> StoreResult<SongStatus> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM songs WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| StoreError::NotFound(format!("song {id}")))?;
        Ok(SongStatus::parse(&status).unwrap_or(SongStatus::Error))
    }

    fn checked_transition(
        conn: &Connection,
        id: &SongId,
        to: SongStatus,
    ) -> StoreResult<SongStatus> {
        let from = Self::current_status(conn, id)?;
        if from == to {
            // Idempotent retry.
            return Ok(from);
        }
        if !super::transition_allowed(from, to) {
            return Err(StoreError::InvalidTransition {
                song: id.clone(),
                from,
                to,
            });
        }
        Ok(from)
    }
}

const PLAYLIST_COLS: &str = "id, playlist_key, name, prompt, prompt_epoch, \
     current_order_index, status, owner_user_id, is_temporary";

const SONG_COLS: &str = "id, playlist_id, order_index, status, title, style, audio_url, \
     audio_duration, cover_url, is_interrupt, interrupt_prompt, prompt_epoch, \
     ace_task_id, error_message, created_at";

#[async_trait]
impl Store for SqliteStore {
    async fn get_playlist_by_id(&self, id: &PlaylistId) -> StoreResult<Option<Playlist>> {
        let conn = self.conn.lock().unwrap();
        let playlist = conn
            .query_row(
                &format!("SELECT {PLAYLIST_COLS} FROM playlists WHERE id = ?1"),
                params![id.as_str()],
                Self::playlist_from_row,
            )
            .optional()?;
        Ok(playlist)
    }

    async fn get_playlist_by_key(&self, key: &str) -> StoreResult<Option<Playlist>> {
        let conn = self.conn.lock().unwrap();
        let playlist = conn
            .query_row(
                &format!("SELECT {PLAYLIST_COLS} FROM playlists WHERE playlist_key = ?1"),
                params![key],
                Self::playlist_from_row,
            )
            .optional()?;
        Ok(playlist)
    }

    async fn list_playlists_by_owner(&self, owner_user_id: &str) -> StoreResult<Vec<Playlist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLAYLIST_COLS} FROM playlists WHERE owner_user_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![owner_user_id], Self::playlist_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_song(&self, id: &SongId) -> StoreResult<Option<Song>> {
        let conn = self.conn.lock().unwrap();
        let song = conn
            .query_row(
                &format!("SELECT {SONG_COLS} FROM songs WHERE id = ?1"),
                params![id.as_str()],
                Self::song_from_row,
            )
            .optional()?;
        Ok(song)
    }

    async fn list_songs_by_playlist(&self, playlist_id: &PlaylistId) -> StoreResult<Vec<Song>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SONG_COLS} FROM songs WHERE playlist_id = ?1 ORDER BY order_index"
        ))?;
        let rows = stmt.query_map(params![playlist_id.as_str()], Self::song_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_work_queue(&self, playlist_id: &PlaylistId) -> StoreResult<WorkQueueInfo> {
        let conn = self.conn.lock().unwrap();
        let max: Option<f64> = conn.query_row(
            "SELECT MAX(order_index) FROM songs WHERE playlist_id = ?1",
            params![playlist_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(WorkQueueInfo {
            max_order_index: max.unwrap_or(0.0),
        })
    }

    async fn create_pending_song(
        &self,
        playlist_id: &PlaylistId,
        order_index: f64,
        options: NewSongOptions,
    ) -> StoreResult<Song> {
        let id = SongId::generate();
        let now = Utc::now();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO songs
                     (id, playlist_id, order_index, status, is_interrupt,
                      interrupt_prompt, prompt_epoch, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    playlist_id.as_str(),
                    order_index,
                    options.is_interrupt as i64,
                    options.interrupt_prompt,
                    options.prompt_epoch,
                    now.to_rfc3339(),
                ],
            )?;
        }
        debug!(
            song.id = %id,
            playlist.id = %playlist_id,
            song.order_index = order_index,
            song.interrupt = options.is_interrupt,
            "pending song created"
        );
        Ok(Song {
            id,
            playlist_id: playlist_id.clone(),
            order_index,
            status: SongStatus::Pending,
            title: None,
            style: None,
            audio_url: None,
            audio_duration: None,
            cover_url: None,
            is_interrupt: options.is_interrupt,
            interrupt_prompt: options.interrupt_prompt,
            prompt_epoch: options.prompt_epoch,
            ace_task_id: None,
            error_message: None,
            created_at: now,
        })
    }

    async fn update_song_status(&self, id: &SongId, status: SongStatus) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::checked_transition(&conn, id, status)?;
        conn.execute(
            "UPDATE songs SET status = ?2 WHERE id = ?1",
            params![id.as_str(), status.as_str()],
        )?;
        Ok(())
    }

    async fn update_song_metadata(
        &self,
        id: &SongId,
        title: &str,
        style: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE songs SET title = ?2, style = ?3 WHERE id = ?1",
            params![id.as_str(), title, style],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("song {id}")));
        }
        Ok(())
    }

    async fn update_song_ace_task(&self, id: &SongId, task_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE songs SET ace_task_id = ?2 WHERE id = ?1",
            params![id.as_str(), task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("song {id}")));
        }
        Ok(())
    }

    async fn update_song_cover(&self, id: &SongId, cover_url: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE songs SET cover_url = ?2 WHERE id = ?1",
            params![id.as_str(), cover_url],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("song {id}")));
        }
        Ok(())
    }

    async fn mark_song_ready(
        &self,
        id: &SongId,
        audio_url: &str,
        audio_duration: Option<f64>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::checked_transition(&conn, id, SongStatus::Ready)?;
        conn.execute(
            "UPDATE songs
                 SET status = 'ready', audio_url = ?2, audio_duration = ?3,
                     error_message = NULL, errored_at_status = NULL
             WHERE id = ?1",
            params![id.as_str(), audio_url, audio_duration],
        )?;
        Ok(())
    }

    async fn mark_song_error(
        &self,
        id: &SongId,
        message: &str,
        errored_at_status: SongStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::checked_transition(&conn, id, SongStatus::Error)?;
        // Keep the stored message short enough for queue views.
        let message: String = message.chars().take(500).collect();
        conn.execute(
            "UPDATE songs
                 SET status = 'error', error_message = ?2, errored_at_status = ?3
             WHERE id = ?1",
            params![id.as_str(), message, errored_at_status.as_str()],
        )?;
        Ok(())
    }

    async fn mark_song_cancelled(
        &self,
        id: &SongId,
        cancelled_at_status: SongStatus,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::checked_transition(&conn, id, SongStatus::Cancelled)?;
        conn.execute(
            "UPDATE songs
                 SET status = 'cancelled', cancelled_at_status = ?2
             WHERE id = ?1",
            params![id.as_str(), cancelled_at_status.as_str()],
        )?;
        Ok(())
    }

    async fn mark_song_played(&self, id: &SongId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::checked_transition(&conn, id, SongStatus::Played)?;
        conn.execute(
            "UPDATE songs SET status = 'played' WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    async fn update_playlist_position(
        &self,
        id: &PlaylistId,
        order_index: f64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE playlists SET current_order_index = ?2 WHERE id = ?1",
            params![id.as_str(), order_index],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("playlist {id}")));
        }
        Ok(())
    }

    async fn heartbeat_playlist(&self, id: &PlaylistId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE playlists SET last_heartbeat_at = ?2 WHERE id = ?1",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn delete_expired_temporary_playlists(
        &self,
        ttl: std::time::Duration,
    ) -> StoreResult<Vec<PlaylistId>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id FROM playlists
                 WHERE is_temporary = 1 AND last_heartbeat_at < ?1",
        )?;
        let expired: Vec<PlaylistId> = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                row.get::<_, String>(0).map(PlaylistId::new)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for id in &expired {
            conn.execute("DELETE FROM songs WHERE playlist_id = ?1", params![id.as_str()])?;
            conn.execute("DELETE FROM playlists WHERE id = ?1", params![id.as_str()])?;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "expired temporary playlists removed");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_playlist(id: &str, key: &str) -> Playlist {
        Playlist {
            id: PlaylistId::new(id),
            playlist_key: key.to_string(),
            name: "Test".to_string(),
            prompt: "upbeat synthwave".to_string(),
            prompt_epoch: 0,
            current_order_index: 0.0,
            status: PlaylistStatus::Active,
            owner_user_id: "user-1".to_string(),
            is_temporary: false,
        }
    }

    #[tokio::test]
    async fn test_playlist_lookup_by_key_and_id() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_playlist(&test_playlist("pl-1", "key-abc")).unwrap();

        let by_key = store.get_playlist_by_key("key-abc").await.unwrap().unwrap();
        assert_eq!(by_key.id.as_str(), "pl-1");
        let by_id = store
            .get_playlist_by_id(&PlaylistId::new("pl-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.playlist_key, "key-abc");
        assert!(store.get_playlist_by_key("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_song_walks_the_pipeline() {
        let store = SqliteStore::in_memory().unwrap();
        let pl = PlaylistId::new("pl-1");
        store.insert_playlist(&test_playlist("pl-1", "k")).unwrap();

        let song = store
            .create_pending_song(&pl, 1.0, NewSongOptions::default())
            .await
            .unwrap();

        store
            .update_song_status(&song.id, SongStatus::GeneratingMetadata)
            .await
            .unwrap();
        store
            .update_song_status(&song.id, SongStatus::MetadataReady)
            .await
            .unwrap();
        store
            .update_song_status(&song.id, SongStatus::SubmittingToAce)
            .await
            .unwrap();
        store
            .update_song_status(&song.id, SongStatus::GeneratingAudio)
            .await
            .unwrap();
        store
            .mark_song_ready(&song.id, "/media/a.mp3", Some(183.0))
            .await
            .unwrap();

        let song = store.get_song(&song.id).await.unwrap().unwrap();
        assert_eq!(song.status, SongStatus::Ready);
        assert_eq!(song.audio_url.as_deref(), Some("/media/a.mp3"));
        assert_eq!(song.audio_duration, Some(183.0));
    }

    #[tokio::test]
    async fn test_illegal_transition_refused() {
        let store = SqliteStore::in_memory().unwrap();
        let pl = PlaylistId::new("pl-1");
        store.insert_playlist(&test_playlist("pl-1", "k")).unwrap();
        let song = store
            .create_pending_song(&pl, 1.0, NewSongOptions::default())
            .await
            .unwrap();

        let err = store
            .update_song_status(&song.id, SongStatus::Saving)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_error_keeps_step_and_truncates_message() {
        let store = SqliteStore::in_memory().unwrap();
        let pl = PlaylistId::new("pl-1");
        store.insert_playlist(&test_playlist("pl-1", "k")).unwrap();
        let song = store
            .create_pending_song(&pl, 1.0, NewSongOptions::default())
            .await
            .unwrap();
        store
            .update_song_status(&song.id, SongStatus::GeneratingMetadata)
            .await
            .unwrap();

        let long = "x".repeat(2000);
        store
            .mark_song_error(&song.id, &long, SongStatus::GeneratingMetadata)
            .await
            .unwrap();

        let song = store.get_song(&song.id).await.unwrap().unwrap();
        assert_eq!(song.status, SongStatus::Error);
        assert_eq!(song.error_message.unwrap().len(), 500);
    }

    #[tokio::test]
    async fn test_work_queue_max_order_index() {
        let store = SqliteStore::in_memory().unwrap();
        let pl = PlaylistId::new("pl-1");
        store.insert_playlist(&test_playlist("pl-1", "k")).unwrap();

        assert_eq!(store.get_work_queue(&pl).await.unwrap().max_order_index, 0.0);
        for idx in [1.0, 3.5, 2.0] {
            store
                .create_pending_song(&pl, idx, NewSongOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(store.get_work_queue(&pl).await.unwrap().max_order_index, 3.5);
    }

    #[tokio::test]
    async fn test_temporary_playlist_expiry() {
        let store = SqliteStore::in_memory().unwrap();
        let mut temp = test_playlist("pl-temp", "k-temp");
        temp.is_temporary = true;
        store.insert_playlist(&temp).unwrap();
        store.insert_playlist(&test_playlist("pl-perm", "k-perm")).unwrap();

        // Zero TTL expires anything not heartbeaten this instant.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = store
            .delete_expired_temporary_playlists(std::time::Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].as_str(), "pl-temp");
        assert!(store
            .get_playlist_by_id(&PlaylistId::new("pl-perm"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_playlist_alive() {
        let store = SqliteStore::in_memory().unwrap();
        let mut temp = test_playlist("pl-temp", "k-temp");
        temp.is_temporary = true;
        store.insert_playlist(&temp).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .heartbeat_playlist(&PlaylistId::new("pl-temp"))
            .await
            .unwrap();
        let removed = store
            .delete_expired_temporary_playlists(std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_bump_prompt_epoch() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_playlist(&test_playlist("pl-1", "k")).unwrap();
        assert_eq!(store.bump_prompt_epoch(&PlaylistId::new("pl-1")).unwrap(), 1);
        assert_eq!(store.bump_prompt_epoch(&PlaylistId::new("pl-1")).unwrap(), 2);
    }
}
