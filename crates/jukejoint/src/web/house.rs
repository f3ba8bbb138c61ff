//! Whole-house endpoints.
//!
//! One command fanned out to every room the caller owns, a session list,
//! and a polling-friendly now-playing view for status-bar widgets.

use super::{ApiError, AppState};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use jukeproto::{CommandAction, DeviceId, PlaylistId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

fn principal(state: &AppState, headers: &HeaderMap) -> Result<crate::auth::Principal, ApiError> {
    state.auth.authenticate(headers).ok_or(ApiError::Unauthorized)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseCommandRequest {
    pub action: CommandAction,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Omitted: every playlist the caller owns.
    #[serde(default)]
    pub playlist_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseCommandResponse {
    pub affected_playlist_ids: Vec<String>,
    pub affected_room_ids: Vec<String>,
    pub skipped_playlist_ids: Vec<String>,
}

/// `POST /house/commands` - fan one room-wide command out to every room
/// whose playlist the caller owns. Playlists the caller does not own (or
/// that do not exist) are skipped, not errors.
pub async fn commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<HouseCommandRequest>,
) -> Result<Json<HouseCommandResponse>, ApiError> {
    let principal = principal(&state, &headers)?;

    let requested: Vec<PlaylistId> = match request.playlist_ids {
        Some(ids) => ids.into_iter().map(PlaylistId::new).collect(),
        None => state
            .store
            .list_playlists_by_owner(&principal.user_id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect(),
    };

    let house_device = DeviceId::new("house");
    let mut affected_playlists = Vec::new();
    let mut affected_rooms = Vec::new();
    let mut skipped = Vec::new();

    for playlist_id in requested {
        let playlist = state.store.get_playlist_by_id(&playlist_id).await?;
        let owned = playlist
            .as_ref()
            .is_some_and(|p| p.owner_user_id == principal.user_id);
        if !owned {
            skipped.push(playlist_id.as_str().to_string());
            continue;
        }

        affected_playlists.push(playlist_id.as_str().to_string());
        for room in state.manager.rooms_for_playlist(&playlist_id).await {
            room.handle_command(&house_device, request.action, request.payload.clone(), None)
                .await;
            affected_rooms.push(room.id.as_str().to_string());
        }
    }

    info!(
        user.id = %principal.user_id,
        command.action = ?request.action,
        affected = affected_playlists.len(),
        skipped = skipped.len(),
        "house command"
    );

    Ok(Json(HouseCommandResponse {
        affected_playlist_ids: affected_playlists,
        affected_room_ids: affected_rooms,
        skipped_playlist_ids: skipped,
    }))
}

/// `GET /house/sessions` - rooms whose playlist the caller owns.
pub async fn sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = principal(&state, &headers)?;

    let mut sessions = Vec::new();
    for room in state.manager.rooms() {
        let Some(playlist) = state.manager.ensure_playlist(&room).await else {
            continue;
        };
        if playlist.owner_user_id != principal.user_id {
            continue;
        }
        let playback = room.playback().await;
        let current = room.current_song().await;
        sessions.push(json!({
            "roomId": room.id.as_str(),
            "name": room.name,
            "playlistId": playlist.id.as_str(),
            "playlistKey": room.playlist_key,
            "deviceCount": room.devices().await.len(),
            "isPlaying": playback.is_playing,
            "currentSong": current.map(|s| json!({
                "songId": s.id.as_str(),
                "title": s.title,
            })),
        }));
    }

    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
pub struct NowPlayingQuery {
    pub room: String,
}

/// `GET /now-playing?room=<id>` - flat polling view for a status bar.
pub async fn now_playing(
    State(state): State<AppState>,
    Query(query): Query<NowPlayingQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room_id = RoomId::new(query.room);
    let room = state
        .manager
        .get(&room_id)
        .ok_or_else(|| ApiError::NotFound(format!("room {room_id}")))?;

    let playback = room.playback().await;
    let current = room.current_song().await;
    let title = current.as_ref().and_then(|s| s.title.clone());
    let text = match (&title, playback.is_playing) {
        (Some(title), true) => format!("▶ {title}"),
        (Some(title), false) => format!("⏸ {title}"),
        (None, _) => "∅".to_string(),
    };

    Ok(Json(json!({
        "room": room.id.as_str(),
        "title": title,
        "isPlaying": playback.is_playing,
        "currentTime": playback.current_time,
        "duration": playback.duration,
        "volume": playback.volume,
        "isMuted": playback.is_muted,
        "text": text,
    })))
}
