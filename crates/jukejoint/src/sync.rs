//! Room event sync.
//!
//! Listens on the bus and keeps every affected room's queue snapshot in
//! step with the store. Also owns idle priming: when a queue refresh
//! seeds playback in an idle room, the playlist gets a keep-alive
//! heartbeat and a runway of pending songs so generation stays ahead of
//! the listener.

use crate::bus::{BusSubscription, EventBus};
use crate::room::{Room, RoomManager};
use crate::store::{NewSongOptions, Store};
use jukeproto::{Event, EventKind, Playlist, PlaylistId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many pending songs idle priming requests.
pub const RUNWAY_SONGS: usize = 5;

struct SyncInner {
    manager: Arc<RoomManager>,
    store: Arc<dyn Store>,
    bus: EventBus,
}

#[derive(Clone)]
pub struct RoomEventSync {
    inner: Arc<SyncInner>,
}

impl RoomEventSync {
    pub fn new(manager: Arc<RoomManager>, store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                manager,
                store,
                bus,
            }),
        }
    }

    /// Attach bus handlers. The returned subscriptions must be kept alive.
    pub fn attach(&self) -> Vec<BusSubscription> {
        let refresh_kinds = [
            EventKind::SongCreated,
            EventKind::SongStatusChanged,
            EventKind::SongDeleted,
            EventKind::SongMetadataUpdated,
            EventKind::SongReordered,
            EventKind::PlaylistSteered,
            EventKind::PlaylistUpdated,
        ];

        let refresh = {
            let sync = self.clone();
            self.inner
                .bus
                .subscribe("room-sync.refresh", &refresh_kinds, move |event| {
                    let sync = sync.clone();
                    async move {
                        if let Some(playlist_id) = event.playlist_id() {
                            sync.refresh_playlist(playlist_id).await;
                        }
                        Ok(())
                    }
                })
        };

        let deleted = {
            let sync = self.clone();
            self.inner.bus.subscribe(
                "room-sync.playlist-deleted",
                &[EventKind::PlaylistDeleted],
                move |event| {
                    let sync = sync.clone();
                    async move {
                        if let Event::PlaylistDeleted { playlist_id } = event {
                            sync.clear_rooms(&playlist_id).await;
                        }
                        Ok(())
                    }
                },
            )
        };

        vec![refresh, deleted]
    }

    /// Refresh every room bound to `playlist_id` from the store.
    pub async fn refresh_playlist(&self, playlist_id: &PlaylistId) {
        let rooms = self.inner.manager.rooms_for_playlist(playlist_id).await;
        if rooms.is_empty() {
            return;
        }
        let playlist = match self.inner.store.get_playlist_by_id(playlist_id).await {
            Ok(Some(playlist)) => playlist,
            Ok(None) => {
                debug!(playlist.id = %playlist_id, "refresh skipped, playlist gone");
                return;
            }
            Err(error) => {
                warn!(playlist.id = %playlist_id, error = %error, "refresh lookup failed");
                return;
            }
        };
        for room in rooms {
            self.refresh_room_with(&room, &playlist).await;
        }
    }

    /// Refresh one room (used at device join time).
    pub async fn refresh_room(&self, room: &Arc<Room>) {
        let Some(playlist) = self.inner.manager.ensure_playlist(room).await else {
            debug!(room.id = %room.id, "no playlist for room yet");
            return;
        };
        self.refresh_room_with(room, &playlist).await;
    }

    async fn refresh_room_with(&self, room: &Arc<Room>, playlist: &Playlist) {
        let songs = match self.inner.store.list_songs_by_playlist(&playlist.id).await {
            Ok(songs) => songs,
            Err(error) => {
                warn!(room.id = %room.id, error = %error, "song list failed");
                return;
            }
        };

        let refresh = room.update_queue(songs, playlist.prompt_epoch).await;
        if refresh.seeded_from_idle {
            info!(
                room.id = %room.id,
                playlist.id = %playlist.id,
                order_index = refresh.seeded_order_index,
                "idle room started, priming generation"
            );
            self.prime(playlist).await;
        }
    }

    /// Idle priming: heartbeat the playlist and queue `RUNWAY_SONGS`
    /// pending songs past the current tail. Failures are logged; the
    /// refresh itself already succeeded.
    async fn prime(&self, playlist: &Playlist) {
        if let Err(error) = self.inner.store.heartbeat_playlist(&playlist.id).await {
            warn!(playlist.id = %playlist.id, error = %error, "prime heartbeat failed");
        }

        let max = match self.inner.store.get_work_queue(&playlist.id).await {
            Ok(info) => info.max_order_index,
            Err(error) => {
                warn!(playlist.id = %playlist.id, error = %error, "prime work-queue lookup failed");
                return;
            }
        };

        for offset in 1..=RUNWAY_SONGS {
            let order_index = max + offset as f64;
            let options = NewSongOptions {
                prompt_epoch: playlist.prompt_epoch,
                ..Default::default()
            };
            match self
                .inner
                .store
                .create_pending_song(&playlist.id, order_index, options)
                .await
            {
                Ok(song) => {
                    self.inner.bus.emit(Event::SongCreated {
                        song_id: song.id,
                        playlist_id: playlist.id.clone(),
                    });
                }
                Err(error) => {
                    warn!(
                        playlist.id = %playlist.id,
                        order_index,
                        error = %error,
                        "prime song creation failed"
                    );
                }
            }
        }
    }

    async fn clear_rooms(&self, playlist_id: &PlaylistId) {
        for room in self.inner.manager.rooms_for_playlist(playlist_id).await {
            info!(room.id = %room.id, playlist.id = %playlist_id, "playlist deleted, clearing queue");
            room.update_queue(Vec::new(), 0).await;
        }
    }
}
