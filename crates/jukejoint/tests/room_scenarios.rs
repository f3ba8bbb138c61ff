//! Room behavior: playback authority, throttles, targeting, seeding.

mod common;

use common::FakeSink;
use jukejoint::room::{Room, RoomCallbacks};
use jukeproto::{
    CommandAction, Device, DeviceId, DeviceMode, DeviceRole, ExecuteScope, PlaylistId, RoomId,
    ServerMessage, Song, SongId, SongStatus,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn song(id: &str, order: f64, epoch: i64, playable: bool) -> Song {
    Song {
        id: SongId::new(id),
        playlist_id: PlaylistId::new("pl"),
        order_index: order,
        status: if playable {
            SongStatus::Ready
        } else {
            SongStatus::GeneratingAudio
        },
        title: Some(format!("Song {id}")),
        style: None,
        audio_url: playable.then(|| format!("/media/{id}.mp3")),
        audio_duration: Some(180.0),
        cover_url: None,
        is_interrupt: false,
        interrupt_prompt: None,
        prompt_epoch: epoch,
        ace_task_id: None,
        error_message: None,
        created_at: chrono::Utc::now(),
    }
}

fn new_room() -> Arc<Room> {
    Room::new(
        RoomId::new("room-1"),
        "room-1".to_string(),
        "room-1".to_string(),
        RoomCallbacks::noop(),
    )
}

fn room_with_played_log() -> (Arc<Room>, Arc<Mutex<Vec<String>>>) {
    let played = Arc::new(Mutex::new(Vec::new()));
    let played_clone = played.clone();
    let callbacks = RoomCallbacks {
        mark_played: Arc::new(move |song_id| {
            played_clone.lock().unwrap().push(song_id.as_str().to_string());
        }),
        report_position: Arc::new(|_| {}),
    };
    (
        Room::new(
            RoomId::new("room-1"),
            "room-1".to_string(),
            "room-1".to_string(),
            callbacks,
        ),
        played,
    )
}

async fn join(room: &Arc<Room>, id: &str, role: DeviceRole) -> Arc<FakeSink> {
    let sink = Arc::new(FakeSink::new());
    room.add_device(DeviceId::new(id), id.to_string(), role, sink.clone())
        .await;
    sink
}

#[tokio::test]
async fn test_join_receives_state_queue_and_next_song() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true), song("b", 2.0, 0, true)], 0)
        .await;

    let sink = join(&room, "player-1", DeviceRole::Player).await;
    let frames = sink.frames();

    assert!(matches!(frames[0], ServerMessage::State { .. }));
    assert!(matches!(frames[1], ServerMessage::Queue { .. }));
    assert!(frames
        .iter()
        .any(|f| matches!(f, ServerMessage::NextSong { start_at: None, .. })));
}

#[tokio::test]
async fn test_playback_authority_ignores_sync_is_playing() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true)], 0).await;
    let _sink = join(&room, "player-1", DeviceRole::Player).await;

    room.handle_command(&DeviceId::new("player-1"), CommandAction::Play, None, None)
        .await;
    assert!(room.playback().await.is_playing);

    // A browser with blocked autoplay keeps reporting paused; the room
    // does not care.
    for n in 0..5 {
        room.handle_sync(
            &DeviceId::new("player-1"),
            Some(SongId::new("a")),
            false,
            n as f64,
            180.0,
        )
        .await;
    }
    assert!(room.playback().await.is_playing);
}

#[tokio::test(start_paused = true)]
async fn test_seek_latches_against_stale_sync_positions() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true)], 0).await;
    let _sink = join(&room, "player-1", DeviceRole::Player).await;
    let player = DeviceId::new("player-1");

    room.handle_command(
        &player,
        CommandAction::Seek,
        Some(json!({ "time": 30.0 })),
        None,
    )
    .await;

    // 200ms later a stale position arrives: discarded, duration kept.
    tokio::time::advance(Duration::from_millis(200)).await;
    room.handle_sync(&player, Some(SongId::new("a")), true, 12.0, 180.0)
        .await;
    let playback = room.playback().await;
    assert_eq!(playback.current_time, 30.0);
    assert_eq!(playback.duration, 180.0);

    // After the suppression window positions apply again.
    tokio::time::advance(Duration::from_millis(400)).await;
    room.handle_sync(&player, Some(SongId::new("a")), true, 45.0, 180.0)
        .await;
    assert_eq!(room.playback().await.current_time, 45.0);
}

#[tokio::test(start_paused = true)]
async fn test_song_ended_debounce_advances_once() {
    let (room, played) = room_with_played_log();
    room.update_queue(
        vec![
            song("a", 1.0, 0, true),
            song("b", 2.0, 0, true),
            song("c", 3.0, 0, true),
        ],
        0,
    )
    .await;
    assert_eq!(
        room.playback().await.current_song_id,
        Some(SongId::new("a"))
    );

    // Three players all report the same natural end.
    for _ in 0..5 {
        room.handle_song_ended().await;
    }
    assert_eq!(
        room.playback().await.current_song_id,
        Some(SongId::new("b"))
    );
    assert_eq!(played.lock().unwrap().as_slice(), ["a"]);

    // Past the debounce window the next end advances again.
    tokio::time::advance(Duration::from_millis(1100)).await;
    room.handle_song_ended().await;
    assert_eq!(
        room.playback().await.current_song_id,
        Some(SongId::new("c"))
    );
}

#[tokio::test]
async fn test_end_of_queue_stops_playback() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true)], 0).await;
    room.handle_song_ended().await;

    let playback = room.playback().await;
    assert_eq!(playback.current_song_id, None);
    assert!(!playback.is_playing);
}

#[tokio::test]
async fn test_targeted_volume_then_sync_all() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true)], 0).await;
    let sink_a = join(&room, "A", DeviceRole::Player).await;
    let sink_b = join(&room, "B", DeviceRole::Player).await;
    sink_a.clear();
    sink_b.clear();

    // Targeted volume moves A to individual mode; only A gets the frame.
    room.handle_command(
        &DeviceId::new("ctl"),
        CommandAction::SetVolume,
        Some(json!({ "volume": 0.3 })),
        Some(DeviceId::new("A")),
    )
    .await;

    let a_exec = sink_a.executes();
    assert_eq!(a_exec.len(), 1);
    match &a_exec[0] {
        ServerMessage::Execute {
            action,
            payload,
            scope,
        } => {
            assert_eq!(*action, CommandAction::SetVolume);
            assert_eq!(payload.as_ref().unwrap()["volume"], 0.3);
            assert_eq!(*scope, ExecuteScope::Device);
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert!(sink_b.executes().is_empty());

    let mode_of = |devices: &[Device], id: &str| {
        devices
            .iter()
            .find(|d| d.id.as_str() == id)
            .map(|d| d.mode)
            .unwrap()
    };
    let devices = room.devices().await;
    assert_eq!(mode_of(&devices, "A"), DeviceMode::Individual);
    assert_eq!(mode_of(&devices, "B"), DeviceMode::Default);

    // A room-wide volume change now skips A.
    sink_a.clear();
    sink_b.clear();
    room.handle_command(
        &DeviceId::new("ctl"),
        CommandAction::SetVolume,
        Some(json!({ "volume": 0.8 })),
        None,
    )
    .await;
    assert!(sink_a.executes().is_empty());
    assert_eq!(sink_b.executes().len(), 1);

    // syncAll resets everyone and re-sends the room volume to both.
    sink_a.clear();
    sink_b.clear();
    room.handle_command(&DeviceId::new("ctl"), CommandAction::SyncAll, None, None)
        .await;

    let devices = room.devices().await;
    assert_eq!(mode_of(&devices, "A"), DeviceMode::Default);
    assert_eq!(mode_of(&devices, "B"), DeviceMode::Default);
    for sink in [&sink_a, &sink_b] {
        let got_volume = sink.executes().iter().any(|f| {
            matches!(
                f,
                ServerMessage::Execute {
                    action: CommandAction::SetVolume,
                    payload: Some(p),
                    ..
                } if p["volume"] == 0.8
            )
        });
        assert!(got_volume, "both players receive the room volume");
    }
}

#[tokio::test]
async fn test_idle_queue_seeds_near_tail() {
    let room = new_room();
    let queue: Vec<Song> = (0..109)
        .map(|n| song(&format!("s{n}"), n as f64, 0, true))
        .collect();

    let refresh = room.update_queue(queue, 0).await;
    assert!(refresh.seeded_from_idle);
    assert_eq!(refresh.seeded_order_index, Some(99.0));

    let playback = room.playback().await;
    assert!(playback.is_playing);
    assert_eq!(playback.current_song_id, Some(SongId::new("s99")));
}

#[tokio::test]
async fn test_short_idle_queue_seeds_from_top() {
    let room = new_room();
    let queue: Vec<Song> = (0..5)
        .map(|n| song(&format!("s{n}"), n as f64, 0, true))
        .collect();

    let refresh = room.update_queue(queue, 0).await;
    assert!(refresh.seeded_from_idle);
    assert_eq!(refresh.seeded_order_index, Some(0.0));
}

#[tokio::test]
async fn test_current_song_dropped_from_queue_stops_playback() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true), song("b", 2.0, 0, true)], 0)
        .await;
    assert!(room.playback().await.is_playing);

    let refresh = room.update_queue(vec![song("b", 2.0, 0, true)], 0).await;
    // The refresh re-seeds from idle after the stop.
    assert!(refresh.seeded_from_idle);
    assert_eq!(
        room.playback().await.current_song_id,
        Some(SongId::new("b"))
    );
}

#[tokio::test]
async fn test_select_song_without_audio_refused() {
    let room = new_room();
    room.update_queue(
        vec![song("a", 1.0, 0, true), song("gen", 2.0, 0, false)],
        0,
    )
    .await;
    assert!(room.playback().await.is_playing);

    room.handle_command(
        &DeviceId::new("ctl"),
        CommandAction::SelectSong,
        Some(json!({ "songId": "gen" })),
        None,
    )
    .await;

    let playback = room.playback().await;
    assert_eq!(playback.current_song_id, None);
    assert!(!playback.is_playing);
}

#[tokio::test(start_paused = true)]
async fn test_sync_broadcasts_throttled_with_trailing() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true)], 0).await;
    let controller = join(&room, "ctl", DeviceRole::Controller).await;
    let _player = join(&room, "player-1", DeviceRole::Player).await;
    let player = DeviceId::new("player-1");

    controller.clear();

    // First sync after a quiet second broadcasts immediately.
    tokio::time::advance(Duration::from_millis(1100)).await;
    room.handle_sync(&player, Some(SongId::new("a")), true, 1.0, 180.0)
        .await;
    assert_eq!(controller.count_states(), 1);

    // A burst right behind it is suppressed...
    for n in 0..4 {
        room.handle_sync(&player, Some(SongId::new("a")), true, 1.0 + n as f64 * 0.2, 180.0)
            .await;
    }
    assert_eq!(controller.count_states(), 1);

    // ...but a trailing broadcast lands once the window passes.
    tokio::time::advance(Duration::from_millis(1100)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(controller.count_states(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transport_command_gives_next_sync_priority() {
    let room = new_room();
    room.update_queue(vec![song("a", 1.0, 0, true)], 0).await;
    let controller = join(&room, "ctl", DeviceRole::Controller).await;
    let player = DeviceId::new("player-1");
    let _player_sink = join(&room, "player-1", DeviceRole::Player).await;

    // Prime the throttle so a plain sync would be suppressed.
    room.handle_sync(&player, Some(SongId::new("a")), true, 1.0, 180.0)
        .await;
    controller.clear();

    room.handle_command(&DeviceId::new("ctl"), CommandAction::Pause, None, None)
        .await;
    let after_command = controller.count_states();

    // Inside the priority window the next sync bypasses the throttle.
    tokio::time::advance(Duration::from_millis(100)).await;
    room.handle_sync(&player, Some(SongId::new("a")), false, 1.5, 180.0)
        .await;
    assert_eq!(controller.count_states(), after_command + 1);
}

#[tokio::test]
async fn test_skip_marks_played_and_advances() {
    let (room, played) = room_with_played_log();
    room.update_queue(vec![song("a", 1.0, 0, true), song("b", 2.0, 0, true)], 0)
        .await;

    room.handle_command(&DeviceId::new("ctl"), CommandAction::Skip, None, None)
        .await;

    assert_eq!(played.lock().unwrap().as_slice(), ["a"]);
    assert_eq!(
        room.playback().await.current_song_id,
        Some(SongId::new("b"))
    );
}

#[tokio::test]
async fn test_closed_sinks_pruned_before_broadcast() {
    let room = new_room();
    let sink_a = join(&room, "A", DeviceRole::Player).await;
    let _sink_b = join(&room, "B", DeviceRole::Player).await;
    assert_eq!(room.devices().await.len(), 2);

    sink_a.close();
    room.update_queue(vec![song("a", 1.0, 0, true)], 0).await;

    let devices = room.devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id.as_str(), "B");
}

#[tokio::test]
async fn test_ping_answered_with_both_clocks() {
    let room = new_room();
    let sink = join(&room, "player-1", DeviceRole::Player).await;
    sink.clear();

    room.handle_ping(&DeviceId::new("player-1"), 12345.0).await;
    let frames = sink.frames();
    match &frames[0] {
        ServerMessage::Pong {
            client_time,
            server_time,
        } => {
            assert_eq!(*client_time, 12345.0);
            assert!(*server_time > 0.0);
        }
        other => panic!("unexpected frame {other:?}"),
    }
}
