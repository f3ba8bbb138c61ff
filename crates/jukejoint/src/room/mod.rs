//! Playback rooms.
//!
//! A room is the in-memory playback authority for one playlist: it owns
//! the device table, the queue snapshot, and the playback state, and it
//! drives players toward that state over their sockets. All mutations go
//! through one async mutex, so the room behaves as a single-writer actor
//! and frames leave each socket in the order the room produced them.

pub mod manager;
pub mod picker;
pub mod sink;

pub use manager::RoomManager;
pub use sink::{ChannelSink, DeviceSink};

use jukeproto::{
    ClientMessage, CommandAction, Device, DeviceId, DeviceMode, DeviceRole, ExecuteScope,
    PlaybackState, PlaylistId, RoomId, ServerMessage, Song, SongId,
};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sync-triggered state broadcasts are limited to one per this interval.
pub const SYNC_BROADCAST_INTERVAL: Duration = Duration::from_millis(1000);
/// A transport command lets the next sync report bypass the throttle for
/// this long.
pub const SYNC_PRIORITY_WINDOW: Duration = Duration::from_millis(500);
/// Sync-reported positions are discarded for this long after a seek.
pub const SEEK_SUPPRESS_WINDOW: Duration = Duration::from_millis(500);
/// Duplicate song-ended reports inside this window are absorbed.
pub const SONG_ENDED_DEBOUNCE: Duration = Duration::from_millis(1000);
/// How far in the future players are told to start the next song.
pub const NEXT_SONG_LEAD_MS: f64 = 500.0;

/// Callbacks the manager injects so a room never holds a manager or store
/// reference.
#[derive(Clone)]
pub struct RoomCallbacks {
    pub mark_played: Arc<dyn Fn(SongId) + Send + Sync>,
    pub report_position: Arc<dyn Fn(f64) + Send + Sync>,
}

impl RoomCallbacks {
    /// Callbacks that do nothing; used by tests.
    pub fn noop() -> Self {
        Self {
            mark_played: Arc::new(|_| {}),
            report_position: Arc::new(|_| {}),
        }
    }
}

/// Result of a queue refresh, so the caller can prime upstream generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueRefresh {
    /// The room went from no current song to playing during this update.
    pub seeded_from_idle: bool,
    /// Order index playback started at, when seeded.
    pub seeded_order_index: Option<f64>,
}

struct DeviceEntry {
    info: Device,
    sink: Arc<dyn DeviceSink>,
}

struct RoomState {
    playlist_id: Option<PlaylistId>,
    playlist_epoch: i64,
    playback: PlaybackState,
    devices: Vec<DeviceEntry>,
    queue: Vec<Song>,
    last_state_broadcast: Option<Instant>,
    trailing_broadcast: Option<JoinHandle<()>>,
    sync_priority_until: Option<Instant>,
    last_seek_at: Option<Instant>,
    song_ended_at: Option<Instant>,
}

pub struct Room {
    pub id: RoomId,
    pub name: String,
    /// Fixed at creation; the playlist id is resolved lazily from it.
    pub playlist_key: String,
    callbacks: RoomCallbacks,
    /// Handle to ourselves for the trailing-broadcast task.
    self_ref: Weak<Room>,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(
        id: RoomId,
        name: String,
        playlist_key: String,
        callbacks: RoomCallbacks,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            name,
            playlist_key,
            callbacks,
            self_ref: self_ref.clone(),
            state: Mutex::new(RoomState {
                playlist_id: None,
                playlist_epoch: 0,
                playback: PlaybackState::default(),
                devices: Vec::new(),
                queue: Vec::new(),
                last_state_broadcast: None,
                trailing_broadcast: None,
                sync_priority_until: None,
                last_seek_at: None,
                song_ended_at: None,
            }),
        })
    }

    pub async fn playlist_id(&self) -> Option<PlaylistId> {
        self.state.lock().await.playlist_id.clone()
    }

    pub(crate) async fn bind_playlist(&self, playlist_id: PlaylistId) {
        self.state.lock().await.playlist_id = Some(playlist_id);
    }

    pub async fn playback(&self) -> PlaybackState {
        self.state.lock().await.playback.clone()
    }

    pub async fn devices(&self) -> Vec<Device> {
        let state = self.state.lock().await;
        state.devices.iter().map(|d| d.info.clone()).collect()
    }

    pub async fn current_song(&self) -> Option<Song> {
        let state = self.state.lock().await;
        current_song(&state).cloned()
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Add (or replace) a device. Sends it the current state and queue,
    /// and a `nextSong` for the current song if it is a player; then
    /// broadcasts state so everyone sees the new device list.
    pub async fn add_device(
        &self,
        id: DeviceId,
        name: String,
        role: DeviceRole,
        sink: Arc<dyn DeviceSink>,
    ) {
        let mut state = self.state.lock().await;
        state.devices.retain(|d| d.info.id != id);
        let info = Device {
            id: id.clone(),
            name,
            role,
            mode: DeviceMode::Default,
        };
        state.devices.push(DeviceEntry {
            info,
            sink: sink.clone(),
        });
        info!(room.id = %self.id, device.id = %id, device.role = ?role, "device joined");

        send_to(&sink, state_frame(&state));
        send_to(
            &sink,
            ServerMessage::Queue {
                songs: state.queue.clone(),
            },
        );
        if role == DeviceRole::Player {
            if let Some(frame) = next_song_frame(&state, None) {
                send_to(&sink, frame);
            }
        }

        self.broadcast_state(&mut state);
    }

    pub async fn remove_device(&self, id: &DeviceId) {
        let mut state = self.state.lock().await;
        let before = state.devices.len();
        state.devices.retain(|d| &d.info.id != id);
        if state.devices.len() != before {
            info!(room.id = %self.id, device.id = %id, "device left");
            self.broadcast_state(&mut state);
        }
    }

    pub async fn set_device_role(&self, id: &DeviceId, role: DeviceRole) {
        let mut state = self.state.lock().await;
        let mut became_player_sink = None;
        if let Some(entry) = state.devices.iter_mut().find(|d| &d.info.id == id) {
            if entry.info.role != role {
                entry.info.role = role;
                if role == DeviceRole::Player {
                    became_player_sink = Some(entry.sink.clone());
                }
            }
        }
        if let Some(sink) = became_player_sink {
            if let Some(frame) = next_song_frame(&state, None) {
                send_to(&sink, frame);
            }
        }
        self.broadcast_state(&mut state);
    }

    /// Replace the queue snapshot. Auto-starts playback when the room was
    /// idle and the new queue has something playable; the return value
    /// tells the sync layer whether to prime upstream generation.
    pub async fn update_queue(&self, songs: Vec<Song>, epoch: i64) -> QueueRefresh {
        let mut state = self.state.lock().await;
        state.queue = songs;
        state.playlist_epoch = epoch;

        // The current song must stay in the queue with audio; otherwise
        // playback stops rather than pointing at nothing.
        if state.playback.current_song_id.is_some() && current_song(&state).is_none() {
            warn!(room.id = %self.id, "current song fell out of the queue, stopping");
            state.playback.current_song_id = None;
            state.playback.is_playing = false;
        }

        let mut refresh = QueueRefresh::default();
        if state.playback.current_song_id.is_none() && !state.queue.is_empty() {
            let start_after = picker::idle_start_order_index(&state.queue);
            let picked = picker::pick_next_song(&state.queue, state.playlist_epoch, start_after)
                .song
                .cloned();
            if let Some(song) = picked {
                info!(
                    room.id = %self.id,
                    song.id = %song.id,
                    song.order_index = song.order_index,
                    "idle room seeded"
                );
                refresh.seeded_from_idle = true;
                refresh.seeded_order_index = Some(song.order_index);
                self.start_song(&mut state, &song, true);
            }
        }

        let queue_frame = ServerMessage::Queue {
            songs: state.queue.clone(),
        };
        self.broadcast_all(&mut state, queue_frame);

        // Preload hint: tell players what comes after the current song.
        if let Some(current) = current_song(&state).cloned() {
            let next = picker::pick_next_song(&state.queue, state.playlist_epoch, current.order_index)
                .song
                .cloned();
            if let Some(next) = next {
                if let Some(url) = next.audio_url.clone() {
                    self.broadcast_players(
                        &mut state,
                        ServerMessage::Preload {
                            song_id: next.id.clone(),
                            audio_url: url,
                        },
                        false,
                    );
                }
            }
        }

        self.broadcast_state(&mut state);
        refresh
    }

    /// One incoming command frame, room-wide or targeted.
    pub async fn handle_command(
        &self,
        device_id: &DeviceId,
        action: CommandAction,
        payload: Option<Value>,
        target_device_id: Option<DeviceId>,
    ) {
        let mut state = self.state.lock().await;
        debug!(
            room.id = %self.id,
            device.id = %device_id,
            command.action = ?action,
            command.targeted = target_device_id.is_some(),
            "command"
        );

        if let Some(target) = target_device_id {
            self.handle_targeted(&mut state, action, payload, &target);
            return;
        }

        match action {
            CommandAction::Play => {
                state.playback.is_playing = true;
                self.raise_sync_priority(&mut state);
                self.broadcast_players(&mut state, execute(CommandAction::Play, None), true);
                self.broadcast_state(&mut state);
            }
            CommandAction::Pause => {
                state.playback.is_playing = false;
                self.raise_sync_priority(&mut state);
                self.broadcast_players(&mut state, execute(CommandAction::Pause, None), true);
                self.broadcast_state(&mut state);
            }
            CommandAction::Toggle => {
                state.playback.is_playing = !state.playback.is_playing;
                self.raise_sync_priority(&mut state);
                self.broadcast_players(&mut state, execute(CommandAction::Toggle, None), true);
                self.broadcast_state(&mut state);
            }
            CommandAction::Seek => {
                let Some(time) = payload.as_ref().and_then(|p| p["time"].as_f64()) else {
                    return;
                };
                state.playback.current_time = time;
                state.last_seek_at = Some(Instant::now());
                self.raise_sync_priority(&mut state);
                self.broadcast_players(
                    &mut state,
                    execute(CommandAction::Seek, Some(serde_json::json!({ "time": time }))),
                    true,
                );
                self.broadcast_state(&mut state);
            }
            CommandAction::SetVolume => {
                let Some(volume) = payload.as_ref().and_then(|p| p["volume"].as_f64()) else {
                    return;
                };
                let volume = volume.clamp(0.0, 1.0);
                state.playback.volume = volume;
                self.broadcast_players(
                    &mut state,
                    execute(
                        CommandAction::SetVolume,
                        Some(serde_json::json!({ "volume": volume })),
                    ),
                    true,
                );
                self.broadcast_state(&mut state);
            }
            CommandAction::ToggleMute => {
                state.playback.is_muted = !state.playback.is_muted;
                self.broadcast_players(&mut state, execute(CommandAction::ToggleMute, None), true);
                self.broadcast_state(&mut state);
            }
            CommandAction::Rate => {
                // Playback-rate changes are passed straight through.
                self.broadcast_players(&mut state, execute(CommandAction::Rate, payload), true);
            }
            CommandAction::Skip => {
                self.advance(&mut state);
            }
            CommandAction::SelectSong => {
                let Some(song_id) = payload
                    .as_ref()
                    .and_then(|p| p["songId"].as_str())
                    .map(SongId::new)
                else {
                    return;
                };
                let song = state
                    .queue
                    .iter()
                    .find(|s| s.id == song_id && s.is_playable())
                    .cloned();
                match song {
                    Some(song) => {
                        self.start_song(&mut state, &song, true);
                        self.broadcast_state(&mut state);
                    }
                    None => self.refuse_advance(&mut state, &song_id),
                }
            }
            CommandAction::SyncAll => {
                for entry in state.devices.iter_mut() {
                    entry.info.mode = DeviceMode::Default;
                }
                let volume = state.playback.volume;
                self.broadcast_players(
                    &mut state,
                    execute(
                        CommandAction::SetVolume,
                        Some(serde_json::json!({ "volume": volume })),
                    ),
                    false,
                );
                let transport = if state.playback.is_playing {
                    CommandAction::Play
                } else {
                    CommandAction::Pause
                };
                self.broadcast_players(&mut state, execute(transport, None), false);
                self.broadcast_state(&mut state);
            }
            CommandAction::ResetToDefault => {
                // Only meaningful with a target.
            }
        }
    }

    fn handle_targeted(
        &self,
        state: &mut RoomState,
        action: CommandAction,
        payload: Option<Value>,
        target: &DeviceId,
    ) {
        if action == CommandAction::ResetToDefault {
            let sink = state
                .devices
                .iter_mut()
                .find(|d| &d.info.id == target)
                .map(|entry| {
                    entry.info.mode = DeviceMode::Default;
                    entry.sink.clone()
                });
            if let Some(sink) = sink {
                // Re-align the device with the room.
                send_to(&sink, state_frame(state));
                let volume = state.playback.volume;
                send_device_execute(
                    &sink,
                    CommandAction::SetVolume,
                    Some(serde_json::json!({ "volume": volume })),
                );
                let transport = if state.playback.is_playing {
                    CommandAction::Play
                } else {
                    CommandAction::Pause
                };
                send_device_execute(&sink, transport, None);
            }
            self.broadcast_state(state);
            return;
        }

        if !action.is_targetable() {
            warn!(room.id = %self.id, command.action = ?action, "command cannot be targeted");
            return;
        }

        let sink = state
            .devices
            .iter_mut()
            .find(|d| &d.info.id == target)
            .map(|entry| {
                entry.info.mode = DeviceMode::Individual;
                entry.sink.clone()
            });
        let Some(sink) = sink else {
            warn!(room.id = %self.id, device.id = %target, "targeted command for unknown device");
            return;
        };
        send_device_execute(&sink, action, payload);
        self.broadcast_state(state);
    }

    /// Player progress report. Never flips `is_playing`: a browser whose
    /// autoplay was blocked must not pause the whole room.
    pub async fn handle_sync(
        &self,
        device_id: &DeviceId,
        _current_song_id: Option<SongId>,
        _reported_is_playing: bool,
        current_time: f64,
        duration: f64,
    ) {
        let mut state = self.state.lock().await;
        if !state.devices.iter().any(|d| &d.info.id == device_id) {
            return;
        }

        let now = Instant::now();
        let seek_suppressed = state
            .last_seek_at
            .is_some_and(|at| now.duration_since(at) < SEEK_SUPPRESS_WINDOW);
        if !seek_suppressed {
            state.playback.current_time = current_time;
        }
        if duration > 0.0 {
            state.playback.duration = duration;
        }

        // Priority window: a recent transport command wants controllers to
        // see the next report immediately.
        if let Some(until) = state.sync_priority_until {
            if now < until {
                state.sync_priority_until = None;
                self.broadcast_state(&mut state);
                return;
            }
            state.sync_priority_until = None;
        }

        let due = state
            .last_state_broadcast
            .map_or(true, |at| now.duration_since(at) >= SYNC_BROADCAST_INTERVAL);
        if due {
            self.broadcast_state(&mut state);
        } else {
            self.schedule_trailing_broadcast(&mut state);
        }
    }

    /// A player reports the current song finished. Debounced: several
    /// players reporting the same end advance exactly once.
    pub async fn handle_song_ended(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state
            .song_ended_at
            .is_some_and(|at| now.duration_since(at) < SONG_ENDED_DEBOUNCE)
        {
            debug!(room.id = %self.id, "duplicate song-ended report ignored");
            return;
        }
        state.song_ended_at = Some(now);
        self.advance(&mut state);
    }

    pub async fn handle_ping(&self, device_id: &DeviceId, client_time: f64) {
        let state = self.state.lock().await;
        if let Some(entry) = state.devices.iter().find(|d| &d.info.id == device_id) {
            send_to(
                &entry.sink,
                ServerMessage::Pong {
                    client_time,
                    server_time: now_millis(),
                },
            );
        }
    }

    /// Route one decoded client frame.
    pub async fn handle_message(&self, device_id: &DeviceId, message: ClientMessage) {
        match message {
            ClientMessage::Command {
                action,
                payload,
                target_device_id,
            } => {
                self.handle_command(device_id, action, payload, target_device_id)
                    .await
            }
            ClientMessage::Sync {
                current_song_id,
                is_playing,
                current_time,
                duration,
            } => {
                self.handle_sync(device_id, current_song_id, is_playing, current_time, duration)
                    .await
            }
            ClientMessage::SongEnded => self.handle_song_ended().await,
            ClientMessage::Ping { client_time } => self.handle_ping(device_id, client_time).await,
            ClientMessage::Join { .. } => {
                debug!(room.id = %self.id, device.id = %device_id, "duplicate join ignored");
            }
        }
    }

    /// Clear timers. The room is unusable afterwards.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.trailing_broadcast.take() {
            handle.abort();
        }
        state.devices.clear();
    }

    // --- internals -----------------------------------------------------

    /// Advance past the current song: mark it played, move to the picker's
    /// choice, or stop at end of queue.
    fn advance(&self, state: &mut RoomState) {
        let current = current_song(state).cloned();
        if let Some(current) = &current {
            (self.callbacks.mark_played)(current.id.clone());
        }
        let after = current.map(|s| s.order_index).unwrap_or(f64::NEG_INFINITY);

        let next = picker::pick_next_song(&state.queue, state.playlist_epoch, after)
            .song
            .cloned();
        match next {
            Some(song) => {
                self.start_song(state, &song, true);
                self.broadcast_state(state);
            }
            None => {
                info!(room.id = %self.id, "end of queue, stopping");
                state.playback.current_song_id = None;
                state.playback.is_playing = false;
                state.playback.current_time = 0.0;
                self.broadcast_state(state);
            }
        }
    }

    /// Make `song` current and tell players to load it.
    fn start_song(&self, state: &mut RoomState, song: &Song, with_lead: bool) {
        state.playback.current_song_id = Some(song.id.clone());
        state.playback.is_playing = true;
        state.playback.current_time = 0.0;
        state.playback.duration = song.audio_duration.unwrap_or(0.0);
        (self.callbacks.report_position)(song.order_index);

        let start_at = with_lead.then(|| now_millis() + NEXT_SONG_LEAD_MS);
        if let Some(url) = song.audio_url.clone() {
            let frame = ServerMessage::NextSong {
                song_id: song.id.clone(),
                audio_url: url,
                start_at,
            };
            self.broadcast_players(state, frame, false);
        }
    }

    /// The advance would point at a song without audio or outside the
    /// queue: refuse it and stop playback instead.
    fn refuse_advance(&self, state: &mut RoomState, song_id: &SongId) {
        warn!(room.id = %self.id, song.id = %song_id, "advance refused, song not playable");
        state.playback.current_song_id = None;
        state.playback.is_playing = false;
        self.broadcast_state(state);
    }

    fn raise_sync_priority(&self, state: &mut RoomState) {
        state.sync_priority_until = Some(Instant::now() + SYNC_PRIORITY_WINDOW);
    }

    /// State broadcast to every device; closed sockets are pruned first.
    fn broadcast_state(&self, state: &mut RoomState) {
        prune_closed(state);
        let frame = state_frame(state);
        self.broadcast_all(state, frame);
        state.last_state_broadcast = Some(Instant::now());
    }

    fn broadcast_all(&self, state: &mut RoomState, frame: ServerMessage) {
        prune_closed(state);
        let Ok(text) = jukeproto::encode_server_message(&frame) else {
            warn!(room.id = %self.id, "failed to encode frame, dropped");
            return;
        };
        state.devices.retain(|d| d.sink.send(text.clone()));
    }

    /// Execute broadcast: open players only; `respect_mode` skips devices
    /// in individual mode.
    fn broadcast_players(&self, state: &mut RoomState, frame: ServerMessage, respect_mode: bool) {
        prune_closed(state);
        let Ok(text) = jukeproto::encode_server_message(&frame) else {
            return;
        };
        state.devices.retain(|d| {
            if d.info.role != DeviceRole::Player {
                return true;
            }
            if respect_mode && d.info.mode == DeviceMode::Individual {
                return true;
            }
            d.sink.send(text.clone())
        });
    }

    fn schedule_trailing_broadcast(&self, state: &mut RoomState) {
        let already = state
            .trailing_broadcast
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        if already {
            return;
        }
        let Some(room) = self.self_ref.upgrade() else {
            return;
        };
        let due_at = state
            .last_state_broadcast
            .map_or_else(Instant::now, |at| at + SYNC_BROADCAST_INTERVAL);
        state.trailing_broadcast = Some(tokio::spawn(async move {
            tokio::time::sleep_until(due_at).await;
            let mut state = room.state.lock().await;
            room.broadcast_state(&mut state);
        }));
    }
}

fn current_song(state: &RoomState) -> Option<&Song> {
    let id = state.playback.current_song_id.as_ref()?;
    state
        .queue
        .iter()
        .find(|s| &s.id == id && s.is_playable())
}

fn state_frame(state: &RoomState) -> ServerMessage {
    ServerMessage::State {
        playback: state.playback.clone(),
        current_song: current_song(state).cloned(),
        devices: state.devices.iter().map(|d| d.info.clone()).collect(),
    }
}

fn next_song_frame(state: &RoomState, start_at: Option<f64>) -> Option<ServerMessage> {
    let song = current_song(state)?;
    Some(ServerMessage::NextSong {
        song_id: song.id.clone(),
        audio_url: song.audio_url.clone()?,
        start_at,
    })
}

fn execute(action: CommandAction, payload: Option<Value>) -> ServerMessage {
    ServerMessage::Execute {
        action,
        payload,
        scope: ExecuteScope::Room,
    }
}

fn send_device_execute(sink: &Arc<dyn DeviceSink>, action: CommandAction, payload: Option<Value>) {
    send_to(
        sink,
        ServerMessage::Execute {
            action,
            payload,
            scope: ExecuteScope::Device,
        },
    );
}

fn send_to(sink: &Arc<dyn DeviceSink>, frame: ServerMessage) {
    if let Ok(text) = jukeproto::encode_server_message(&frame) {
        let _ = sink.send(text);
    }
}

fn prune_closed(state: &mut RoomState) {
    state.devices.retain(|d| d.sink.is_open());
}

fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}
