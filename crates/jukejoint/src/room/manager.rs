//! Room registry.
//!
//! The manager owns the rooms; rooms never hold a reference back. The
//! store callbacks injected into each room are plain function handles
//! capturing only the store, so dropping the manager does not require
//! untangling a cycle.

use super::{Room, RoomCallbacks};
use crate::store::Store;
use dashmap::DashMap;
use jukeproto::{Playlist, PlaylistId, RoomId, SongId};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<Room>>,
    store: Arc<dyn Store>,
}

impl RoomManager {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
            store,
        })
    }

    pub fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.clone())
    }

    /// Fetch or create the room for `room_id`. The room id doubles as the
    /// playlist key clients share.
    pub fn get_or_create(&self, room_id: RoomId) -> Arc<Room> {
        if let Some(room) = self.rooms.get(&room_id) {
            return room.clone();
        }

        let playlist_key = room_id.as_str().to_string();
        let callbacks = RoomCallbacks {
            mark_played: {
                let store = self.store.clone();
                Arc::new(move |song_id: SongId| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        if let Err(error) = store.mark_song_played(&song_id).await {
                            warn!(song.id = %song_id, error = %error, "mark-played failed");
                        }
                    });
                })
            },
            report_position: {
                let store = self.store.clone();
                let key = playlist_key.clone();
                Arc::new(move |order_index: f64| {
                    let store = store.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        let playlist = match store.get_playlist_by_key(&key).await {
                            Ok(Some(playlist)) => playlist,
                            Ok(None) => return,
                            Err(error) => {
                                warn!(playlist.key = %key, error = %error, "position lookup failed");
                                return;
                            }
                        };
                        if let Err(error) =
                            store.update_playlist_position(&playlist.id, order_index).await
                        {
                            warn!(
                                playlist.id = %playlist.id,
                                error = %error,
                                "position report failed"
                            );
                        }
                    });
                })
            },
        };

        let room = Room::new(
            room_id.clone(),
            playlist_key.clone(),
            playlist_key,
            callbacks,
        );

        self.rooms.entry(room_id).or_insert(room).value().clone()
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Resolve the room's playlist, binding lazily by key on first use.
    /// The resolution is cached on the room but never persisted.
    pub async fn ensure_playlist(&self, room: &Arc<Room>) -> Option<Playlist> {
        if let Some(id) = room.playlist_id().await {
            match self.store.get_playlist_by_id(&id).await {
                Ok(Some(playlist)) => return Some(playlist),
                Ok(None) => {
                    debug!(room.id = %room.id, playlist.id = %id, "bound playlist vanished");
                }
                Err(error) => {
                    warn!(room.id = %room.id, error = %error, "playlist lookup failed");
                    return None;
                }
            }
        }

        match self.store.get_playlist_by_key(&room.playlist_key).await {
            Ok(Some(playlist)) => {
                room.bind_playlist(playlist.id.clone()).await;
                Some(playlist)
            }
            Ok(None) => None,
            Err(error) => {
                warn!(room.id = %room.id, error = %error, "playlist key lookup failed");
                None
            }
        }
    }

    /// Every room currently bound (or lazily bindable) to `playlist_id`.
    pub async fn rooms_for_playlist(&self, playlist_id: &PlaylistId) -> Vec<Arc<Room>> {
        let rooms = self.rooms();
        let mut matching = Vec::new();
        for room in rooms {
            let bound = match room.playlist_id().await {
                Some(id) => Some(id),
                None => self.ensure_playlist(&room).await.map(|p| p.id),
            };
            if bound.as_ref() == Some(playlist_id) {
                matching.push(room);
            }
        }
        matching
    }

    pub async fn dispose_all(&self) {
        for room in self.rooms() {
            room.dispose().await;
        }
        self.rooms.clear();
    }
}
